use anyhow::{bail, Context};
use clap::{crate_version, App, Arg};

use mzc::error::CompileResult;
use mzc::ir::{AssignKind, CallArgument, CompareKind, Instruction, Operand, UNRESOLVED_TARGET};
use mzc::log::ConsoleLog;
use mzc::semantic::Compiler;
use mzc::symbols::{BaseType, ExpressionKind, SymbolType};
use mzc::target;

use std::fs::File;

fn main() -> anyhow::Result<()> {
    let args = App::new("mzc")
        .version(crate_version!())
        .arg(
            Arg::new("target")
                .short('t')
                .long("target")
                .value_name("TARGET")
                .takes_value(true)
                .default_value("dos")
                .possible_values(["dos"])
                .help("Compilation target"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Show verbose compilation output"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .takes_value(true)
                .required(true)
                .value_name("FILE")
                .help("Output executable"),
        )
        .get_matches();

    let target_name = args.value_of("target").unwrap();
    if target_name != "dos" {
        bail!("Unsupported compilation target: {}", target_name);
    }

    let output = args.value_of("output").unwrap();

    let log = ConsoleLog::new(args.is_present("verbose"));
    let mut compiler = Compiler::new(Box::new(log));

    let built = build_demo_program(&mut compiler).and_then(|_| compiler.finish_parse());
    if let Err(error) = built {
        eprintln!("{}", error.diagnostic());
        bail!("Build failed");
    }

    let mut file = File::create(output)
        .with_context(|| format!("Failed to open for writing: {}", output))?;

    if let Err(error) = target::emit(&mut compiler, &mut file) {
        eprintln!("{}", error.diagnostic());
        bail!("Build failed");
    }

    Ok(())
}

/// El analizador sintáctico es un colaborador externo; hasta que esté
/// enlazado, el binario alimenta el API semántico a mano con un programa
/// de prueba, igual que lo haría el parser:
///
/// ```text
/// uint8 Main() {
///     uint32 i;
///     i = 1;
///     loop:
///     PrintUint32(i);
///     PrintNewLine();
///     i = i * 2;
///     if (i < 100000) goto loop;
///     return 0;
/// }
/// ```
fn build_demo_program(c: &mut Compiler) -> CompileResult<()> {
    const U8: SymbolType = SymbolType::new(BaseType::Uint8);
    const U32: SymbolType = SymbolType::new(BaseType::Uint32);

    // Salto inicial sobre las declaraciones, hacia el punto de entrada
    let entry_jump = c.add_to_stream_with_backpatch(Instruction::Goto {
        target: UNRESOLVED_TARGET,
    });
    let body = c.next_ip();

    c.declare_local(U32, 0, "i", ExpressionKind::Variable)?;

    c.add_to_stream(Instruction::Assign {
        kind: AssignKind::None,
        dst_value: "i".to_string(),
        dst_index: None,
        op1: Operand::constant("1", U32),
        op2: None,
    });

    let loop_ip = c.next_ip();

    c.lower_call(
        "PrintUint32",
        &[CallArgument {
            value: "i".to_string(),
            typ: U32,
            exp_type: ExpressionKind::Variable,
        }],
    )?;
    c.add_to_stream(Instruction::Call {
        target: "PrintUint32".to_string(),
        return_symbol: None,
    });

    c.lower_call("PrintNewLine", &[])?;
    c.add_to_stream(Instruction::Call {
        target: "PrintNewLine".to_string(),
        return_symbol: None,
    });

    c.add_to_stream(Instruction::Assign {
        kind: AssignKind::Multiply,
        dst_value: "i".to_string(),
        dst_index: None,
        op1: Operand::variable("i", U32),
        op2: Some(Operand::constant("2", U32)),
    });

    c.add_to_stream(Instruction::If {
        kind: CompareKind::Less,
        op1: Operand::variable("i", U32),
        op2: Operand::constant("100000", U32),
        target: loop_ip,
    });

    c.add_to_stream(Instruction::Return {
        op: Some(Operand::constant("0", U8)),
    });

    c.define_function("Main", U8)?;

    c.backpatch(entry_jump, body)?;
    Ok(())
}
