//! Pruebas de integración del back end.
//!
//! Cada prueba juega el papel del analizador sintáctico: alimenta el API
//! semántico a mano y examina la imagen MZ resultante, desde los campos
//! de la cabecera hasta secuencias concretas de código máquina.

use mzc::error::ErrorKind;
use mzc::ir::{
    AssignKind, CallArgument, CompareKind, Instruction, Operand, UNRESOLVED_TARGET,
};
use mzc::log::NullLog;
use mzc::semantic::Compiler;
use mzc::symbols::{BaseType, ExpressionKind, SymbolType};

const U8: SymbolType = SymbolType::new(BaseType::Uint8);
const U16: SymbolType = SymbolType::new(BaseType::Uint16);
const U32: SymbolType = SymbolType::new(BaseType::Uint32);
const STR: SymbolType = SymbolType::new(BaseType::String);

fn compiler() -> Compiler {
    Compiler::new(Box::new(NullLog))
}

/// Cierra el análisis y emite la imagen completa.
fn emit_image(c: &mut Compiler) -> Vec<u8> {
    c.finish_parse().expect("reachability");

    let mut image = Vec::new();
    mzc::target::emit(c, &mut image).expect("emit");
    image
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    haystack
        .windows(needle.len())
        .filter(|window| *window == needle)
        .count()
}

fn read_u16(image: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([image[offset], image[offset + 1]])
}

/// `uint8 Main() { return 0; }`
fn build_minimal(c: &mut Compiler) {
    let entry = c.add_to_stream_with_backpatch(Instruction::Goto {
        target: UNRESOLVED_TARGET,
    });
    let body = c.next_ip();

    c.add_to_stream(Instruction::Return {
        op: Some(Operand::constant("0", U8)),
    });

    c.define_function("Main", U8).expect("Main");
    c.backpatch(entry, body).expect("backpatch");
}

/// `if ("abc" == s) { nop } return 0;` con `s` estática.
fn build_string_compare(c: &mut Compiler) {
    c.declare_static(STR, 0, "s").expect("static");

    let entry = c.add_to_stream_with_backpatch(Instruction::Goto {
        target: UNRESOLVED_TARGET,
    });
    let body = c.next_ip();

    let exit_ip = body + 2;
    c.add_to_stream(Instruction::If {
        kind: CompareKind::Equal,
        op1: Operand::constant("abc", STR),
        op2: Operand::variable("s", STR),
        target: exit_ip,
    });
    c.add_to_stream(Instruction::Nop);
    c.add_to_stream(Instruction::Return {
        op: Some(Operand::constant("0", U8)),
    });

    c.define_function("Main", U8).expect("Main");
    c.backpatch(entry, body).expect("backpatch");
}

#[test]
fn minimal_entry_point_image_is_stable() {
    let mut c = compiler();
    build_minimal(&mut c);
    let image = emit_image(&mut c);

    // Cabecera de 28 bytes rellenada a 32, más 19 bytes de código
    #[rustfmt::skip]
    let expected: Vec<u8> = vec![
        // Cabecera MZ
        b'M', b'Z',             // firma
        19, 0,                  // last_block_size
        1, 0,                   // block_count
        0, 0,                   // reloc_count
        2, 0,                   // header_paragraphs
        0x01, 0x02,             // min_extra_paragraphs
        0x01, 0x02,             // max_extra_paragraphs
        0, 0,                   // ss (modelo plano)
        0x20, 0x21,             // sp = 0x2000 + (ss << 4) + PSP
        0, 0,                   // checksum
        0, 0,                   // ip
        0, 0,                   // cs
        0, 0,                   // reloc_table_offset
        0, 0,                   // overlay_count
        0, 0, 0, 0,             // relleno hasta el párrafo
        // Prólogo del punto de entrada: DS = SS = ES
        0x8C, 0xD8,             // mov ax, ds
        0x8E, 0xD0,             // mov ss, ax
        0x8E, 0xC0,             // mov es, ax
        0x66, 0x8B, 0xEC,       // mov ebp, esp
        0x81, 0xEC, 0x00, 0x00, // sub esp, 0
        // return 0
        0xB0, 0x00,             // mov al, 0
        0xB4, 0x4C, 0xCD, 0x21, // int 21h, ah = 4Ch
    ];

    assert_eq!(image, expected);
}

#[test]
fn static_assignment_folds_constants_and_stores_to_ds() {
    let mut c = compiler();

    c.declare_static(U32, 0, "x").expect("static");

    let entry = c.add_to_stream_with_backpatch(Instruction::Goto {
        target: UNRESOLVED_TARGET,
    });
    let body = c.next_ip();

    // x = 5 + 7
    c.add_to_stream(Instruction::Assign {
        kind: AssignKind::Add,
        dst_value: "x".to_string(),
        dst_index: None,
        op1: Operand::constant("5", U32),
        op2: Some(Operand::constant("7", U32)),
    });
    c.add_to_stream(Instruction::Return {
        op: Some(Operand::constant("0", U8)),
    });

    c.define_function("Main", U8).expect("Main");
    c.backpatch(entry, body).expect("backpatch");

    let image = emit_image(&mut c);

    // Un único mov r32, imm32 con la suma ya plegada
    assert!(contains(&image, &[0x66, 0xB8, 12, 0, 0, 0]));
    assert_eq!(count(&image, &[0x66, 0xB8]), 1);

    // Escritura de 32 bits a la dirección estática: el código mide 30
    // bytes, así que "x" queda en 30 + 0x100
    assert!(contains(&image, &[0x66, 0x89, 0x06, 0x1E, 0x01]));

    // La región estática pide memoria extra: 4 bytes más el stack
    assert_eq!(read_u16(&image, 10), ((4 + 0x2000 + 15) >> 4) + 1);
}

#[test]
fn unreferenced_function_is_not_emitted() {
    let mut c = compiler();

    let entry = c.add_to_stream_with_backpatch(Instruction::Goto {
        target: UNRESOLVED_TARGET,
    });

    // void dead() { return; } — nadie la llama
    c.add_to_stream(Instruction::Return { op: None });
    c.define_function("dead", SymbolType::new(BaseType::Void))
        .expect("dead");

    let body = c.next_ip();
    c.add_to_stream(Instruction::Return {
        op: Some(Operand::constant("0", U8)),
    });
    c.define_function("Main", U8).expect("Main");
    c.backpatch(entry, body).expect("backpatch");

    let image = emit_image(&mut c);

    assert_eq!(c.find_symbol_by_name("dead").unwrap().ref_count, 0);

    // El epílogo stdcall de "dead" (pop ebp) no aparece por ningún lado
    assert!(!contains(&image, &[0x66, 0x5D]));

    // La imagen es idéntica a la del programa sin la función muerta
    let mut minimal = compiler();
    build_minimal(&mut minimal);
    assert_eq!(image, emit_image(&mut minimal));
}

#[test]
fn string_comparison_calls_shared_helper() {
    let mut c = compiler();
    build_string_compare(&mut c);
    let image = emit_image(&mut c);

    // push imm16 del literal, push rm16 de la variable, call rel16
    assert!(contains(&image, &[0xFF, 0x36]));
    assert!(contains(&image, &[0xE8]));

    // or al, al y el salto sobre el resultado
    assert!(contains(&image, &[0x08, 0xC0, 0x75]));

    // #StringsEqual quedó referenciada y emitida (lodsb es su marca)
    assert!(c.find_symbol_by_name("#StringsEqual").unwrap().ref_count >= 1);
    assert!(contains(&image, &[0xAC]));

    // El literal vive una única vez en el pool, terminado en NUL
    assert_eq!(count(&image, b"abc\0"), 1);
}

#[test]
fn short_and_near_jumps_are_selected_by_distance() {
    // Destino cercano: jz rel8
    let mut c = compiler();
    c.declare_static(U8, 0, "a").expect("static");

    let entry = c.add_to_stream_with_backpatch(Instruction::Goto {
        target: UNRESOLVED_TARGET,
    });
    let body = c.next_ip();

    c.add_to_stream(Instruction::If {
        kind: CompareKind::Equal,
        op1: Operand::variable("a", U8),
        op2: Operand::constant("1", U8),
        target: body + 2,
    });
    c.add_to_stream(Instruction::Nop);
    c.add_to_stream(Instruction::Return {
        op: Some(Operand::constant("0", U8)),
    });
    c.define_function("Main", U8).expect("Main");
    c.backpatch(entry, body).expect("backpatch");

    let image = emit_image(&mut c);
    assert!(contains(&image, &[0x80, 0xF8, 0x01, 0x74]));
    assert!(!contains(&image, &[0x0F, 0x84]));

    // Destino lejano (estimación de 21 instrucciones): jz rel16
    let mut c = compiler();
    c.declare_static(U8, 0, "a").expect("static");

    let entry = c.add_to_stream_with_backpatch(Instruction::Goto {
        target: UNRESOLVED_TARGET,
    });
    let body = c.next_ip();

    c.add_to_stream(Instruction::If {
        kind: CompareKind::Equal,
        op1: Operand::variable("a", U8),
        op2: Operand::constant("1", U8),
        target: body + 21,
    });
    for _ in 0..20 {
        c.add_to_stream(Instruction::Nop);
    }
    c.add_to_stream(Instruction::Return {
        op: Some(Operand::constant("0", U8)),
    });
    c.define_function("Main", U8).expect("Main");
    c.backpatch(entry, body).expect("backpatch");

    let image = emit_image(&mut c);
    assert!(contains(&image, &[0x80, 0xF8, 0x01, 0x0F, 0x84]));
}

#[test]
fn goto_label_resolves_backward_and_forward() {
    let mut c = compiler();

    let entry = c.add_to_stream_with_backpatch(Instruction::Goto {
        target: UNRESOLVED_TARGET,
    });
    let body = c.next_ip();

    // ip 1: nop; ip 2: top:; ip 3: goto top; ip 4: return
    c.add_to_stream(Instruction::Nop);
    c.add_label("top", body + 1).expect("label");
    c.add_to_stream(Instruction::Nop);
    c.add_to_stream(Instruction::GotoLabel {
        label: "top".to_string(),
    });
    c.add_to_stream(Instruction::Return {
        op: Some(Operand::constant("0", U8)),
    });

    c.define_function("Main", U8).expect("Main");
    c.backpatch(entry, body).expect("backpatch");

    let image = emit_image(&mut c);

    // Salto corto hacia atrás, a la instrucción inmediata anterior
    assert!(contains(&image, &[0xEB, 0xFE]));

    // Hacia adelante: sin estimación posible, siempre rel16
    let mut c = compiler();

    let entry = c.add_to_stream_with_backpatch(Instruction::Goto {
        target: UNRESOLVED_TARGET,
    });
    let body = c.next_ip();

    c.add_to_stream(Instruction::GotoLabel {
        label: "end".to_string(),
    });
    c.add_to_stream(Instruction::Nop);
    c.add_label("end", body + 2).expect("label");
    c.add_to_stream(Instruction::Return {
        op: Some(Operand::constant("0", U8)),
    });

    c.define_function("Main", U8).expect("Main");
    c.backpatch(entry, body).expect("backpatch");

    let image = emit_image(&mut c);
    assert!(contains(&image, &[0xE9, 0x00, 0x00]));
}

#[test]
fn call_arguments_widen_to_formal_size() {
    let mut c = compiler();

    c.declare_static(U8, 0, "b").expect("static");

    let entry = c.add_to_stream_with_backpatch(Instruction::Goto {
        target: UNRESOLVED_TARGET,
    });
    let body = c.next_ip();

    c.lower_call(
        "PrintUint32",
        &[CallArgument {
            value: "b".to_string(),
            typ: U8,
            exp_type: ExpressionKind::Variable,
        }],
    )
    .expect("call");
    c.add_to_stream(Instruction::Call {
        target: "PrintUint32".to_string(),
        return_symbol: None,
    });
    c.add_to_stream(Instruction::Return {
        op: Some(Operand::constant("0", U8)),
    });

    c.define_function("Main", U8).expect("Main");
    c.backpatch(entry, body).expect("backpatch");

    let image = emit_image(&mut c);

    // El uint8 se ensancha con movzx y se apila como dword
    assert!(contains(&image, &[0x66, 0x0F, 0xB6, 0x06]));
    assert!(contains(&image, &[0x66, 0x50]));

    // PrintUint32 se emitió: el divisor decimal es su marca
    assert!(contains(&image, &[0x66, 0xF7, 0xF1]));
}

#[test]
fn division_uses_ax_dx_convention() {
    let mut c = compiler();

    c.declare_static(U16, 0, "x").expect("static");
    c.declare_static(U16, 0, "y").expect("static");

    let entry = c.add_to_stream_with_backpatch(Instruction::Goto {
        target: UNRESOLVED_TARGET,
    });
    let body = c.next_ip();

    // x = x / y
    c.add_to_stream(Instruction::Assign {
        kind: AssignKind::Divide,
        dst_value: "x".to_string(),
        dst_index: None,
        op1: Operand::variable("x", U16),
        op2: Some(Operand::variable("y", U16)),
    });
    c.add_to_stream(Instruction::Return {
        op: Some(Operand::constant("0", U8)),
    });

    c.define_function("Main", U8).expect("Main");
    c.backpatch(entry, body).expect("backpatch");

    let image = emit_image(&mut c);

    // Numerador ensanchado al doble para limpiar DX, DX en cero y
    // división contra la memoria del denominador
    assert!(contains(&image, &[0x66, 0x0F, 0xB7, 0x06]));
    assert!(contains(&image, &[0x33, 0xD2]));
    assert!(contains(&image, &[0xF7, 0x36]));
}

#[test]
fn indexed_store_is_not_cached() {
    let mut c = compiler();

    // static uint8* arr con 10 elementos pre-reservados
    c.declare_static(SymbolType::pointer_to(BaseType::Uint8, 1), 10, "arr")
        .expect("static");

    let entry = c.add_to_stream_with_backpatch(Instruction::Goto {
        target: UNRESOLVED_TARGET,
    });
    let body = c.next_ip();

    // arr[0] = 5
    c.add_to_stream(Instruction::Assign {
        kind: AssignKind::None,
        dst_value: "arr".to_string(),
        dst_index: Some(mzc::ir::OperandIndex {
            value: "0".to_string(),
            typ: U8,
            exp_type: ExpressionKind::Constant,
        }),
        op1: Operand::constant("5", U8),
        op2: None,
    });
    c.add_to_stream(Instruction::Return {
        op: Some(Operand::constant("0", U8)),
    });

    c.define_function("Main", U8).expect("Main");
    c.backpatch(entry, body).expect("backpatch");

    let image = emit_image(&mut c);

    // Una única escritura indexada [DI + base]
    assert_eq!(count(&image, &[0x88, 0x85]), 1);

    // El destino no quedó cacheado: el retorno no vuelca nada a la
    // región estática
    assert!(!contains(&image, &[0x88, 0x06]));
    assert!(!contains(&image, &[0x89, 0x06]));
}

#[test]
fn stack_directive_controls_sp_with_clamping() {
    // Valor válido
    let mut c = compiler();
    c.parse_compiler_directive("#stack 64", |_, _| false);
    build_minimal(&mut c);
    let image = emit_image(&mut c);
    assert_eq!(read_u16(&image, 16), 64 + 0x20 + 0x100);

    // Por debajo del mínimo: tamaño por defecto de 8 KiB
    let mut c = compiler();
    c.parse_compiler_directive("#stack 10", |_, _| false);
    build_minimal(&mut c);
    let image = emit_image(&mut c);
    assert_eq!(read_u16(&image, 16), 0x2000 + 0x20 + 0x100);

    // Por encima del máximo: también el tamaño por defecto
    let mut c = compiler();
    c.parse_compiler_directive("#stack 40000", |_, _| false);
    build_minimal(&mut c);
    let image = emit_image(&mut c);
    assert_eq!(read_u16(&image, 16), 0x2000 + 0x20 + 0x100);
}

#[test]
fn mz_block_arithmetic_matches_image_size() {
    let mut c = compiler();
    build_string_compare(&mut c);
    let image = emit_image(&mut c);

    let last_block_size = read_u16(&image, 2) as usize;
    let block_count = read_u16(&image, 4) as usize;

    let code_size = image.len() - 32;
    let padding = if last_block_size > 0 {
        512 - last_block_size
    } else {
        0
    };
    assert_eq!(block_count * 512 - padding, code_size);
}

#[test]
fn compilation_is_deterministic() {
    let mut first = compiler();
    build_string_compare(&mut first);
    let first = emit_image(&mut first);

    let mut second = compiler();
    build_string_compare(&mut second);
    let second = emit_image(&mut second);

    assert_eq!(first, second);
}

#[test]
fn prototype_and_direct_definition_emit_the_same_code() {
    const VOID: SymbolType = SymbolType::new(BaseType::Void);

    // void f(uint16 a); declarada primero como prototipo
    let mut with_prototype = compiler();
    with_prototype.declare_parameter(U16, "a").expect("param");
    with_prototype
        .declare_function_prototype("f", VOID)
        .expect("prototype");

    let build_rest = |c: &mut Compiler| {
        let entry = c.add_to_stream_with_backpatch(Instruction::Goto {
            target: UNRESOLVED_TARGET,
        });

        c.add_to_stream(Instruction::Return { op: None });
        c.declare_parameter(U16, "a").expect("param");
        c.define_function("f", VOID).expect("f");

        let body = c.next_ip();
        c.lower_call(
            "f",
            &[CallArgument {
                value: "5".to_string(),
                typ: U16,
                exp_type: ExpressionKind::Constant,
            }],
        )
        .expect("call");
        c.add_to_stream(Instruction::Call {
            target: "f".to_string(),
            return_symbol: None,
        });
        c.add_to_stream(Instruction::Return {
            op: Some(Operand::constant("0", U8)),
        });
        c.define_function("Main", U8).expect("Main");
        c.backpatch(entry, body).expect("backpatch");
    };

    build_rest(&mut with_prototype);
    let with_prototype = emit_image(&mut with_prototype);

    // La misma función definida directamente
    let mut direct = compiler();
    build_rest(&mut direct);
    let direct = emit_image(&mut direct);

    assert_eq!(with_prototype, direct);
    assert!(contains(&direct, &[0x68, 0x05, 0x00])); // push imm16 del argumento
    assert!(contains(&direct, &[0xC2, 0x02, 0x00])); // retn 2: f libera su parámetro
}

#[test]
fn missing_return_in_nonvoid_function_fails() {
    let mut c = compiler();

    let entry = c.add_to_stream_with_backpatch(Instruction::Goto {
        target: UNRESOLVED_TARGET,
    });

    // uint16 f() { nop } — sin return
    c.add_to_stream(Instruction::Nop);
    c.define_function("f", U16).expect("f");

    let body = c.next_ip();
    c.declare_local(U16, 0, "r", ExpressionKind::Variable)
        .expect("local");
    c.lower_call("f", &[]).expect("call");
    c.add_to_stream(Instruction::Call {
        target: "f".to_string(),
        return_symbol: Some("r".to_string()),
    });
    c.add_to_stream(Instruction::Return {
        op: Some(Operand::constant("0", U8)),
    });
    c.define_function("Main", U8).expect("Main");
    c.backpatch(entry, body).expect("backpatch");

    c.finish_parse().expect("reachability");

    let mut image = Vec::new();
    let error = mzc::target::emit(&mut c, &mut image).unwrap_err();
    assert_eq!(error.kind, ErrorKind::Compilation);
    assert_eq!(
        error.message,
        "Function \"f\" must have \"return\" as the last statement"
    );
}

#[test]
fn void_function_gets_synthetic_return() {
    let mut c = compiler();

    let entry = c.add_to_stream_with_backpatch(Instruction::Goto {
        target: UNRESOLVED_TARGET,
    });

    // void f() { nop } — el retorno se sintetiza
    c.add_to_stream(Instruction::Nop);
    c.define_function("f", SymbolType::new(BaseType::Void))
        .expect("f");

    let body = c.next_ip();
    c.lower_call("f", &[]).expect("call");
    c.add_to_stream(Instruction::Call {
        target: "f".to_string(),
        return_symbol: None,
    });
    c.add_to_stream(Instruction::Return {
        op: Some(Operand::constant("0", U8)),
    });
    c.define_function("Main", U8).expect("Main");
    c.backpatch(entry, body).expect("backpatch");

    let image = emit_image(&mut c);

    // pop ebp + retn de la función sintetizada
    assert!(contains(&image, &[0x66, 0x5D, 0xC3]));

    // Y la llamada quedó resuelta hacia atrás (f se emite primero)
    assert!(contains(&image, &[0xE8]));
}
