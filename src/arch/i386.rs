//! Codificación de instrucciones i386.
//!
//! Los codificadores escriben directamente los bytes de cada instrucción
//! en el búfer de código. El modo de operación es el real de 16 bits: las
//! formas de 32 bits llevan el prefijo de tamaño de operando `0x66`.

use crate::buffer::CodeBuffer;
use crate::error::CompileResult;

/// Registros de propósito general.
///
/// La codificación coincide con el campo `reg` de ModRM; los nombres de
/// 8 bits bajos (AL, CL, DL, BL) comparten codificación con las formas de
/// 16/32 bits, y los altos (AH, CH, DH, BH) se obtienen con [`CpuRegister::h8`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CpuRegister {
    AX = 0,
    CX = 1,
    DX = 2,
    BX = 3,
    SP = 4,
    BP = 5,
    SI = 6,
    DI = 7,
}

impl CpuRegister {
    /// Codificación ModRM del registro.
    pub fn enc(self) -> u8 {
        self as u8
    }

    /// Codificación de la mitad alta de 8 bits (AH, CH, DH, BH).
    pub fn h8(self) -> u8 {
        self.enc() + 4
    }
}

/// Registros de segmento.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CpuSegment {
    ES = 0,
    CS = 1,
    SS = 2,
    DS = 3,
    FS = 4,
    GS = 5,
}

impl CpuSegment {
    pub fn enc(self) -> u8 {
        self as u8
    }
}

/// Prefijo de tamaño de operando para las formas de 32 bits.
pub const OPERAND_SIZE: u8 = 0x66;

/// Byte ModRM a partir de sus tres campos.
pub fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    ((md << 6) & 0xC0) | ((reg << 3) & 0x38) | (rm & 0x07)
}

/// Opcode con registro embebido (familias `0x40+r`, `0xB8+r`, ...).
pub fn opr(op: u8, reg: u8) -> u8 {
    op + (reg & 0x07)
}

/// `mov r, r` del tamaño indicado.
pub fn mov_rr(
    buf: &mut CodeBuffer,
    to: CpuRegister,
    from: CpuRegister,
    size: i32,
) -> CompileResult<()> {
    match size {
        1 => {
            // mov r8, rm8
            buf.emit_code(&[0x8A, modrm(3, to.enc(), from.enc())]);
        }
        2 => {
            // mov r16, rm16
            buf.emit_code(&[0x8B, modrm(3, to.enc(), from.enc())]);
        }
        4 => {
            // mov r32, rm32
            buf.emit_code(&[OPERAND_SIZE, 0x8B, modrm(3, to.enc(), from.enc())]);
        }

        _ => unexpected!(),
    }

    Ok(())
}

/// `mov r16, sreg`.
pub fn mov_r_sreg(buf: &mut CodeBuffer, r16: CpuRegister, sreg: CpuSegment) {
    buf.emit_code(&[0x8C, modrm(3, sreg.enc(), r16.enc())]);
}

/// `mov sreg, r16`.
pub fn mov_sreg_r(buf: &mut CodeBuffer, sreg: CpuSegment, r16: CpuRegister) {
    buf.emit_code(&[0x8E, modrm(3, sreg.enc(), r16.enc())]);
}

/// `add r, r` del tamaño indicado.
pub fn add_rr(
    buf: &mut CodeBuffer,
    to: CpuRegister,
    from: CpuRegister,
    size: i32,
) -> CompileResult<()> {
    match size {
        1 => {
            // add rm8, r8
            buf.emit_code(&[0x00, modrm(3, from.enc(), to.enc())]);
        }
        2 => {
            // add rm16, r16
            buf.emit_code(&[0x01, modrm(3, from.enc(), to.enc())]);
        }
        4 => {
            // add rm32, r32
            buf.emit_code(&[OPERAND_SIZE, 0x01, modrm(3, from.enc(), to.enc())]);
        }

        _ => unexpected!(),
    }

    Ok(())
}

/// `sub r, r` del tamaño indicado.
pub fn sub_rr(
    buf: &mut CodeBuffer,
    to: CpuRegister,
    from: CpuRegister,
    size: i32,
) -> CompileResult<()> {
    match size {
        1 => {
            // sub rm8, r8
            buf.emit_code(&[0x28, modrm(3, from.enc(), to.enc())]);
        }
        2 => {
            // sub rm16, r16
            buf.emit_code(&[0x29, modrm(3, from.enc(), to.enc())]);
        }
        4 => {
            // sub rm32, r32
            buf.emit_code(&[OPERAND_SIZE, 0x29, modrm(3, from.enc(), to.enc())]);
        }

        _ => unexpected!(),
    }

    Ok(())
}

/// `inc r` del tamaño indicado.
pub fn inc_r(buf: &mut CodeBuffer, r: CpuRegister, size: i32) -> CompileResult<()> {
    match size {
        1 => {
            // inc rm8
            buf.emit_code(&[0xFE, modrm(3, 0, r.enc())]);
        }
        2 => {
            // inc r16
            buf.emit_code(&[opr(0x40, r.enc())]);
        }
        4 => {
            // inc r32
            buf.emit_code(&[OPERAND_SIZE, opr(0x40, r.enc())]);
        }

        _ => unexpected!(),
    }

    Ok(())
}

/// `dec r` del tamaño indicado.
pub fn dec_r(buf: &mut CodeBuffer, r: CpuRegister, size: i32) -> CompileResult<()> {
    match size {
        1 => {
            // dec rm8
            buf.emit_code(&[0xFE, modrm(3, 1, r.enc())]);
        }
        2 => {
            // dec r16
            buf.emit_code(&[opr(0x48, r.enc())]);
        }
        4 => {
            // dec r32
            buf.emit_code(&[OPERAND_SIZE, opr(0x48, r.enc())]);
        }

        _ => unexpected!(),
    }

    Ok(())
}

/// `or r, r` del tamaño indicado.
pub fn or_rr(
    buf: &mut CodeBuffer,
    to: CpuRegister,
    from: CpuRegister,
    size: i32,
) -> CompileResult<()> {
    match size {
        1 => {
            // or rm8, r8
            buf.emit_code(&[0x08, modrm(3, from.enc(), to.enc())]);
        }
        2 => {
            // or rm16, r16
            buf.emit_code(&[0x09, modrm(3, from.enc(), to.enc())]);
        }
        4 => {
            // or rm32, r32
            buf.emit_code(&[OPERAND_SIZE, 0x09, modrm(3, from.enc(), to.enc())]);
        }

        _ => unexpected!(),
    }

    Ok(())
}

/// Apertura de un procedimiento: `push ebp; mov ebp, esp`.
pub fn proc_enter(buf: &mut CodeBuffer) {
    buf.emit_code(&[
        OPERAND_SIZE,
        opr(0x50, CpuRegister::BP.enc()), // push ebp
        OPERAND_SIZE,
        0x8B, // mov ebp, esp
        modrm(3, CpuRegister::BP.enc(), CpuRegister::SP.enc()),
    ]);
}

/// Cierre de un procedimiento: restauración opcional del stack, `pop ebp`
/// y `retn`. `retn_imm16` libera los bytes de parámetros (stdcall).
pub fn proc_leave(buf: &mut CodeBuffer, retn_imm16: u16, restore_sp: bool) {
    if restore_sp {
        // Solo hace falta si el procedimiento movió el stack pointer
        buf.emit_code(&[
            OPERAND_SIZE,
            0x8B, // mov esp, ebp
            modrm(3, CpuRegister::SP.enc(), CpuRegister::BP.enc()),
        ]);
    }

    buf.emit_code(&[OPERAND_SIZE, opr(0x58, CpuRegister::BP.enc())]); // pop ebp

    proc_leave_no_frame(buf, retn_imm16);
}

/// `retn` sin tocar el stack frame. El stack debe estar intacto porque no
/// hay puntero base guardado que restaurar.
pub fn proc_leave_no_frame(buf: &mut CodeBuffer, retn_imm16: u16) {
    if retn_imm16 > 0 {
        let imm = retn_imm16.to_le_bytes();
        buf.emit_code(&[0xC2, imm[0], imm[1]]); // retn imm16
    } else {
        buf.emit_code(&[0xC3]); // retn
    }
}

/// Interrupción de software.
pub fn int(buf: &mut CodeBuffer, imm8: u8) {
    buf.emit_code(&[0xCD, imm8]);
}

/// Interrupción de software con carga previa de AH. AH queda sobrescrito.
pub fn int_ah(buf: &mut CodeBuffer, imm8: u8, ah_imm8: u8) {
    buf.emit_code(&[
        0xB4, // mov ah, imm8
        ah_imm8,
        0xCD, // int imm8
        imm8,
    ]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes<F: FnOnce(&mut CodeBuffer)>(emit: F) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        emit(&mut buf);
        buf.as_slice().to_vec()
    }

    #[test]
    fn modrm_packs_fields() {
        assert_eq!(modrm(3, 0, 0), 0xC0);
        assert_eq!(modrm(1, 2, 6), 0x56);
        assert_eq!(modrm(0, 7, 5), 0x3D);
    }

    #[test]
    fn mov_encodings_per_size() {
        use CpuRegister::*;

        assert_eq!(
            bytes(|b| mov_rr(b, AX, BX, 1).unwrap()),
            vec![0x8A, 0xC3]
        );
        assert_eq!(
            bytes(|b| mov_rr(b, CX, DX, 2).unwrap()),
            vec![0x8B, 0xCA]
        );
        assert_eq!(
            bytes(|b| mov_rr(b, AX, DX, 4).unwrap()),
            vec![0x66, 0x8B, 0xC2]
        );
    }

    #[test]
    fn segment_moves() {
        assert_eq!(
            bytes(|b| mov_r_sreg(b, CpuRegister::AX, CpuSegment::DS)),
            vec![0x8C, 0xD8]
        );
        assert_eq!(
            bytes(|b| mov_sreg_r(b, CpuSegment::SS, CpuRegister::AX)),
            vec![0x8E, 0xD0]
        );
    }

    #[test]
    fn inc_dec_use_short_forms_when_possible() {
        use CpuRegister::*;

        assert_eq!(bytes(|b| inc_r(b, SI, 2).unwrap()), vec![0x46]);
        assert_eq!(bytes(|b| inc_r(b, BX, 1).unwrap()), vec![0xFE, 0xC3]);
        assert_eq!(bytes(|b| dec_r(b, DI, 2).unwrap()), vec![0x4F]);
        assert_eq!(bytes(|b| dec_r(b, CX, 4).unwrap()), vec![0x66, 0x49]);
    }

    #[test]
    fn procedure_frames() {
        assert_eq!(
            bytes(proc_enter),
            vec![0x66, 0x55, 0x66, 0x8B, 0xEC]
        );
        assert_eq!(
            bytes(|b| proc_leave(b, 4, false)),
            vec![0x66, 0x5D, 0xC2, 0x04, 0x00]
        );
        assert_eq!(
            bytes(|b| proc_leave(b, 0, true)),
            vec![0x66, 0x8B, 0xE5, 0x66, 0x5D, 0xC3]
        );
        assert_eq!(bytes(|b| proc_leave_no_frame(b, 0)), vec![0xC3]);
    }

    #[test]
    fn software_interrupts() {
        assert_eq!(bytes(|b| int(b, 0x21)), vec![0xCD, 0x21]);
        assert_eq!(
            bytes(|b| int_ah(b, 0x21, 0x4C)),
            vec![0xB4, 0x4C, 0xCD, 0x21]
        );
    }
}
