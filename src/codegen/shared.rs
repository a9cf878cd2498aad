//! Biblioteca de funciones compartidas.
//!
//! Rutinas de soporte escritas a mano en i386 que el back end anexa a la
//! imagen solo cuando el marcado de alcanzabilidad les dejó referencias.
//! Todas siguen la convención stdcall del resto del código generado. Las
//! de entrada/salida comparten un búfer de trabajo de 32 bytes dentro de
//! la región de código.

use super::{DosExeEmitter, FixupTargetKind};
use crate::arch::i386::{self, modrm, CpuRegister, CpuSegment};
use crate::error::CompileResult;
use crate::symbols::BaseType;

/// Búfer compartido para operaciones de entrada/salida.
const IO_BUFFER_SIZE: u16 = 0x20;

/// Posición relativa a un hueco de salto corto pendiente de rellenar.
struct LocalJump {
    offset: usize,
    at_ip: i32,
}

impl<'a> DosExeEmitter<'a> {
    pub(crate) fn emit_shared_functions(&mut self) -> CompileResult<()> {
        self.log.info("Emitting shared functions...");
        self.log.push_indent();

        // Varias rutinas necesitan el búfer de E/S; se reserva solo si
        // alguna quedó referenciada
        let io_buffer_needed = self.symbols.iter().any(|symbol| {
            symbol.typ.base == BaseType::SharedFunction
                && symbol.ref_count > 0
                && matches!(
                    symbol.name.as_str(),
                    "PrintUint32" | "PrintNewLine" | "ReadUint32"
                )
        });

        let mut io_buffer_address: u16 = 0;
        if io_buffer_needed {
            io_buffer_address = (self.buf.ip() + super::PSP_OFFSET) as u16;
            self.buf.emit_zeroed(IO_BUFFER_SIZE as usize);
        }

        self.emit_shared_function("PrintUint32", |emitter| {
            emitter.shared_print_uint32(io_buffer_address)
        })?;
        self.emit_shared_function("PrintString", Self::shared_print_string)?;
        self.emit_shared_function("PrintNewLine", |emitter| {
            emitter.shared_print_new_line(io_buffer_address)
        })?;
        self.emit_shared_function("ReadUint32", |emitter| {
            emitter.shared_read_uint32(io_buffer_address)
        })?;
        self.emit_shared_function("GetCommandLine", Self::shared_get_command_line)?;
        self.emit_shared_function("#StringsEqual", Self::shared_strings_equal)?;
        self.emit_shared_function("#Alloc", Self::shared_alloc)?;
        self.emit_shared_function("release", Self::shared_release)?;

        self.log.pop_indent();
        Ok(())
    }

    /// Emite la rutina si quedó referenciada, resolviendo antes las
    /// llamadas pendientes hacia ella.
    fn emit_shared_function<F>(&mut self, name: &str, body: F) -> CompileResult<()>
    where
        F: FnOnce(&mut Self) -> CompileResult<()>,
    {
        let referenced = self.symbols.iter().any(|symbol| {
            symbol.typ.base == BaseType::SharedFunction
                && symbol.name == name
                && symbol.ref_count > 0
        });

        if !referenced {
            return Ok(());
        }

        self.log.info(&format!("Emitting \"{}\"...", name));

        let ip_dst = self.buf.ip();
        self.backpatch_labels(name, ip_dst, FixupTargetKind::Function)?;

        body(self)
    }

    /// Salto condicional corto hacia adelante, con el destino pendiente.
    fn jump_forward(&mut self, opcode: u8) -> LocalJump {
        self.buf.emit_code(&[opcode, 0]);
        LocalJump {
            offset: self.buf.offset() - 1,
            at_ip: self.buf.ip(),
        }
    }

    /// Salto condicional corto hacia una posición ya emitida.
    fn jump_backward(&mut self, opcode: u8, target_ip: i32) {
        self.buf.emit_code(&[opcode, 0]);
        let offset = self.buf.offset() - 1;
        self.buf.patch_i8(offset, (target_ip - self.buf.ip()) as i8);
    }

    fn land_jump(&mut self, jump: LocalJump) {
        let here = self.buf.ip();
        self.buf.patch_i8(jump.offset, (here - jump.at_ip) as i8);
    }

    /// Descompone el parámetro en dígitos decimales de derecha a
    /// izquierda dentro del búfer de E/S y lo imprime con DOS 09h.
    fn shared_print_uint32(&mut self, io_buffer: u16) -> CompileResult<()> {
        i386::proc_enter(&mut self.buf);

        // mov eax, ss:[bp + 6]
        self.buf.emit_code(&[
            i386::OPERAND_SIZE,
            0x8B,
            modrm(1, CpuRegister::AX.enc(), 6),
            6,
        ]);

        self.load_constant_sized(10, CpuRegister::CX, 4)?;
        self.load_constant_sized(20, CpuRegister::DI, 2)?;

        // mov byte [io + di], '$'
        let io = io_buffer.to_le_bytes();
        self.buf
            .emit_code(&[0xC6, modrm(2, 0, 5), io[0], io[1], b'$']);

        let digit_loop = self.buf.ip();

        i386::dec_r(&mut self.buf, CpuRegister::DI, 2)?;

        self.zero_register(CpuRegister::DX, 4)?;

        // div ecx
        self.buf.emit_code(&[
            i386::OPERAND_SIZE,
            0xF7,
            modrm(3, 6, CpuRegister::CX.enc()),
        ]);

        // add dl, '0'
        self.buf
            .emit_code(&[0x80, modrm(3, 0, CpuRegister::DX.enc()), b'0']);

        // mov [io + di], dl
        self.buf
            .emit_code(&[0x88, modrm(2, CpuRegister::DX.enc(), 5), io[0], io[1]]);

        // cmp eax, 0
        self.buf.emit_code(&[
            i386::OPERAND_SIZE,
            0x83,
            modrm(3, 7, CpuRegister::AX.enc()),
            0,
        ]);

        self.jump_backward(0x75, digit_loop); // jnz

        self.load_constant_sized(i32::from(io_buffer), CpuRegister::DX, 2)?;

        i386::add_rr(&mut self.buf, CpuRegister::DX, CpuRegister::DI, 2)?;

        i386::int_ah(&mut self.buf, 0x21, 0x09); // Write String To Stdout

        i386::proc_leave(&mut self.buf, 4, false);
        Ok(())
    }

    /// Recorre la cadena hasta el NUL, la termina temporalmente con `$`
    /// para DOS 09h y restaura el byte pisado.
    fn shared_print_string(&mut self) -> CompileResult<()> {
        i386::proc_enter(&mut self.buf);

        // mov dx, ss:[bp + 6]
        self.buf
            .emit_code(&[0x8B, modrm(1, CpuRegister::DX.enc(), 6), 6]);

        i386::mov_rr(&mut self.buf, CpuRegister::SI, CpuRegister::DX, 2)?;

        let scan_loop = self.buf.ip();

        // mov bl, [si]
        self.buf
            .emit_code(&[0x8A, modrm(0, CpuRegister::BX.enc(), 4)]);

        i386::inc_r(&mut self.buf, CpuRegister::SI, 2)?;

        i386::or_rr(&mut self.buf, CpuRegister::BX, CpuRegister::BX, 1)?;

        self.jump_backward(0x75, scan_loop); // jnz

        i386::dec_r(&mut self.buf, CpuRegister::SI, 2)?;

        // mov byte [si], '$'
        self.buf.emit_code(&[0xC6, modrm(0, 0, 4), b'$']);

        i386::int_ah(&mut self.buf, 0x21, 0x09); // Write String To Stdout

        // mov [si], bl
        self.buf
            .emit_code(&[0x88, modrm(0, CpuRegister::BX.enc(), 4)]);

        i386::proc_leave(&mut self.buf, 2, false);
        Ok(())
    }

    fn shared_print_new_line(&mut self, io_buffer: u16) -> CompileResult<()> {
        // mov dword [io], '\r\n$\0'
        let io = io_buffer.to_le_bytes();
        let terminator = 0x00240A0Du32.to_le_bytes();
        self.buf.emit_code(&[
            i386::OPERAND_SIZE,
            0xC7,
            modrm(0, 0, 6),
            io[0],
            io[1],
            terminator[0],
            terminator[1],
            terminator[2],
            terminator[3],
        ]);

        self.load_constant_sized(i32::from(io_buffer), CpuRegister::DX, 2)?;

        i386::int_ah(&mut self.buf, 0x21, 0x09); // Write String To Stdout

        i386::proc_leave_no_frame(&mut self.buf, 0);
        Ok(())
    }

    /// Entrada con búfer de DOS 0Ah; interpreta los dígitos decimales
    /// hasta el primer carácter que no lo sea.
    fn shared_read_uint32(&mut self, io_buffer: u16) -> CompileResult<()> {
        // mov word [io], <tamaño del búfer>
        let io = io_buffer.to_le_bytes();
        let size = IO_BUFFER_SIZE.to_le_bytes();
        self.buf
            .emit_code(&[0xC7, modrm(0, 0, 6), io[0], io[1], size[0], size[1]]);

        self.load_constant_sized(i32::from(io_buffer), CpuRegister::DX, 2)?;

        i386::int_ah(&mut self.buf, 0x21, 0x0A); // Buffered Keyboard Input

        self.zero_register(CpuRegister::AX, 4)?;
        self.zero_register(CpuRegister::BX, 4)?;

        self.load_constant_sized(2, CpuRegister::SI, 2)?;
        self.load_constant_sized(10, CpuRegister::CX, 4)?;

        let digit_loop = self.buf.ip();

        // mov bl, [io + si]
        self.buf
            .emit_code(&[0x8A, modrm(2, CpuRegister::BX.enc(), 4), io[0], io[1]]);

        // cmp bl, '9'
        self.buf
            .emit_code(&[0x80, modrm(3, 7, CpuRegister::BX.enc()), b'9']);

        let above_digits = self.jump_forward(0x77); // ja

        // sub bl, '0'
        self.buf
            .emit_code(&[0x80, modrm(3, 5, CpuRegister::BX.enc()), b'0']);

        let below_digits = self.jump_forward(0x72); // jb

        // mul ecx
        self.buf.emit_code(&[
            i386::OPERAND_SIZE,
            0xF7,
            modrm(3, 4, CpuRegister::CX.enc()),
        ]);

        i386::add_rr(&mut self.buf, CpuRegister::AX, CpuRegister::BX, 4)?;

        i386::inc_r(&mut self.buf, CpuRegister::SI, 2)?;

        self.jump_backward(0xEB, digit_loop); // jmp

        self.land_jump(above_digits);
        self.land_jump(below_digits);

        i386::proc_leave_no_frame(&mut self.buf, 0);
        Ok(())
    }

    /// Devuelve en AX la cola de comandos del PSP, sin espacios al
    /// principio ni al final y terminada en NUL.
    fn shared_get_command_line(&mut self) -> CompileResult<()> {
        // La cola de comandos vive en PSP:0081
        self.load_constant_sized(0x81 - 1, CpuRegister::SI, 2)?;

        let skip_leading = self.buf.ip();

        i386::inc_r(&mut self.buf, CpuRegister::SI, 2)?;

        // cmp byte [si], ' '
        self.buf.emit_code(&[0x80, modrm(0, 7, 4), b' ']);

        self.jump_backward(0x74, skip_leading); // jz

        // El comienzo queda en AX
        i386::mov_rr(&mut self.buf, CpuRegister::AX, CpuRegister::SI, 2)?;

        i386::dec_r(&mut self.buf, CpuRegister::SI, 2)?;

        let find_cr = self.buf.ip();

        i386::inc_r(&mut self.buf, CpuRegister::SI, 2)?;

        // cmp byte [si], '\r'
        self.buf.emit_code(&[0x80, modrm(0, 7, 4), 0x0D]);

        self.jump_backward(0x75, find_cr); // jnz

        let trim_trailing = self.buf.ip();

        i386::dec_r(&mut self.buf, CpuRegister::SI, 2)?;

        // cmp byte [si], ' '
        self.buf.emit_code(&[0x80, modrm(0, 7, 4), b' ']);

        self.jump_backward(0x74, trim_trailing); // jz

        i386::inc_r(&mut self.buf, CpuRegister::SI, 2)?;

        // mov byte [si], '\0'
        self.buf.emit_code(&[0xC6, modrm(0, 0, 4), 0x00]);

        i386::proc_leave_no_frame(&mut self.buf, 0);
        Ok(())
    }

    /// Compara dos cadenas terminadas en NUL; 1 en AL si son iguales.
    fn shared_strings_equal(&mut self) -> CompileResult<()> {
        i386::proc_enter(&mut self.buf);

        // mov si, ss:[bp + 6]
        self.buf
            .emit_code(&[0x8B, modrm(1, CpuRegister::SI.enc(), 6), 6]);

        // mov di, ss:[bp + 8]
        self.buf
            .emit_code(&[0x8B, modrm(1, CpuRegister::DI.enc(), 6), 8]);

        // cmp si, di
        self.buf.emit_code(&[
            0x39,
            modrm(3, CpuRegister::DI.enc(), CpuRegister::SI.enc()),
        ]);

        let same_pointer = self.jump_forward(0x74); // jz

        i386::dec_r(&mut self.buf, CpuRegister::DI, 2)?;

        let compare_loop = self.buf.ip();

        i386::inc_r(&mut self.buf, CpuRegister::DI, 2)?;

        // lodsb
        self.buf.emit_code(&[0xAC]);

        // cmp [di], al
        self.buf
            .emit_code(&[0x38, modrm(0, CpuRegister::AX.enc(), 5)]);

        let not_equal = self.jump_forward(0x75); // jnz

        // cmp al, 0
        self.buf
            .emit_code(&[0x80, modrm(3, 7, CpuRegister::AX.enc()), 0]);

        self.jump_backward(0x75, compare_loop); // jnz

        // Iguales
        self.land_jump(same_pointer);

        self.load_constant_sized(1, CpuRegister::AX, 1)?;

        let done = self.jump_forward(0xEB); // jmp

        // Distintas
        self.land_jump(not_equal);

        self.zero_register(CpuRegister::AX, 1)?;

        self.land_jump(done);

        i386::proc_leave(&mut self.buf, 4, false);
        Ok(())
    }

    /// Reserva párrafos con DOS 48h y devuelve un puntero de 16 bits, o
    /// cero si la memoria no existe o queda fuera del alcance del modelo
    /// plano. Los segmentos inalcanzables se liberan antes de fallar.
    // TODO: Verificar que (ptr + bytes) sea accesible por completo; si no
    // lo es, liberar y devolver null
    fn shared_alloc(&mut self) -> CompileResult<()> {
        i386::proc_enter(&mut self.buf);

        // mov ebx, ss:[bp + 6]
        self.buf.emit_code(&[
            i386::OPERAND_SIZE,
            0x8B,
            modrm(1, CpuRegister::BX.enc(), 6),
            6,
        ]);

        // or bx, bx deja las banderas listas para el salto
        i386::or_rr(&mut self.buf, CpuRegister::BX, CpuRegister::BX, 2)?;

        let null_request = self.jump_forward(0x74); // jz

        // No se puede reservar más de 64k
        // test ebx, 0xFFFF0000
        let mask = 0xFFFF0000u32.to_le_bytes();
        self.buf.emit_code(&[
            i386::OPERAND_SIZE,
            0xF7,
            modrm(3, 0, CpuRegister::BX.enc()),
            mask[0],
            mask[1],
            mask[2],
            mask[3],
        ]);

        let too_large = self.jump_forward(0x75); // jnz

        // Bytes a párrafos, con redondeo hacia arriba
        // add bx, 15
        self.buf
            .emit_code(&[0x81, modrm(3, 0, CpuRegister::BX.enc()), 15, 0]);

        // shr bx, 4
        self.buf
            .emit_code(&[0xC1, modrm(3, 5, CpuRegister::BX.enc()), 4]);

        i386::int_ah(&mut self.buf, 0x21, 0x48); // Allocate Memory

        let allocation_failed = self.jump_forward(0x72); // jc

        // Desbordamiento del segmento de 16 bits
        // test ax, 0xF000
        self.buf.emit_code(&[
            0xF7,
            modrm(3, 0, CpuRegister::AX.enc()),
            0x00,
            0xF0,
        ]);

        let segment_overflow = self.jump_forward(0x75); // jnz

        // Respaldo del segmento reservado
        i386::mov_rr(&mut self.buf, CpuRegister::CX, CpuRegister::AX, 2)?;

        i386::mov_r_sreg(&mut self.buf, CpuRegister::BX, CpuSegment::DS);

        i386::sub_rr(&mut self.buf, CpuRegister::AX, CpuRegister::BX, 2)?;

        // El segmento queda antes de DS: inalcanzable
        let segment_too_far = self.jump_forward(0x72); // jb

        // Segmento a puntero
        // shl ax, 4
        self.buf
            .emit_code(&[0xC1, modrm(3, 4, CpuRegister::AX.enc()), 4]);

        let return_pointer = self.jump_forward(0xEB); // jmp

        // Se restaura el segmento respaldado y se libera
        self.land_jump(segment_too_far);

        i386::mov_rr(&mut self.buf, CpuRegister::AX, CpuRegister::CX, 2)?;

        self.land_jump(segment_overflow);

        i386::mov_r_sreg(&mut self.buf, CpuRegister::CX, CpuSegment::ES);

        i386::mov_sreg_r(&mut self.buf, CpuSegment::ES, CpuRegister::AX);

        i386::int_ah(&mut self.buf, 0x21, 0x49); // Free Allocated Memory

        i386::mov_sreg_r(&mut self.buf, CpuSegment::ES, CpuRegister::CX);

        // Respuesta nula
        self.land_jump(null_request);
        self.land_jump(too_large);
        self.land_jump(allocation_failed);

        self.zero_register(CpuRegister::AX, 2)?;

        self.land_jump(return_pointer);

        i386::proc_leave(&mut self.buf, 2, false);
        Ok(())
    }

    /// Convierte el puntero a segmento y lo libera con DOS 49h.
    fn shared_release(&mut self) -> CompileResult<()> {
        i386::proc_enter(&mut self.buf);

        // mov ax, ss:[bp + 6]
        self.buf
            .emit_code(&[0x8B, modrm(1, CpuRegister::AX.enc(), 6), 6]);

        // Puntero a segmento
        // shr ax, 4
        self.buf
            .emit_code(&[0xC1, modrm(3, 5, CpuRegister::AX.enc()), 4]);

        // Respaldo de ES
        i386::mov_r_sreg(&mut self.buf, CpuRegister::CX, CpuSegment::ES);

        // DS es la base del modelo plano
        i386::mov_r_sreg(&mut self.buf, CpuRegister::BX, CpuSegment::DS);

        i386::add_rr(&mut self.buf, CpuRegister::AX, CpuRegister::BX, 2)?;

        i386::mov_sreg_r(&mut self.buf, CpuSegment::ES, CpuRegister::AX);

        i386::int_ah(&mut self.buf, 0x21, 0x49); // Free Allocated Memory

        // Se restaura ES
        i386::mov_sreg_r(&mut self.buf, CpuSegment::ES, CpuRegister::CX);

        i386::proc_leave(&mut self.buf, 2, false);
        Ok(())
    }
}
