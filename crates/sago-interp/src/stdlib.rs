//! Base native packages registered into every context.
//!
//! A real deployment registers generated package tables; these hand-written
//! bindings cover what the runner and the test corpus need: `os` (Exit),
//! `fmt` (Print/Println/Sprint), and `strconv` (Itoa/Atoi).

use std::sync::Arc;

use crate::context::Context;
use crate::error::Panic;
use crate::registry::{extern_fn, Package};
use crate::value::{format_value, Value};

pub fn register_std(ctx: &Arc<Context>) {
    register_os(ctx);
    register_fmt(ctx);
    register_strconv(ctx);
}

fn register_os(ctx: &Arc<Context>) {
    let mut pkg = Package::new("os", "os");
    // os.Exit resolves through the interpreter's special case so that
    // deferred functions still run; this entry keeps the package present
    // for link checks and introspection.
    pkg.func(
        "Exit",
        extern_fn(|itp, args| {
            let code = args.first().map(|v| v.as_int()).transpose()?.unwrap_or(0) as i32;
            if itp.has_exited() {
                std::process::exit(code);
            }
            Err(Panic::Exit(code))
        }),
    );
    ctx.register_package(pkg);
}

fn join_operands(args: &[Value], spaced: bool) -> String {
    let mut out = String::new();
    for (i, a) in args.iter().enumerate() {
        if spaced && i > 0 {
            out.push(' ');
        }
        out.push_str(&format_value(a));
    }
    out
}

fn register_fmt(ctx: &Arc<Context>) {
    let mut pkg = Package::new("fmt", "fmt");
    pkg.func(
        "Println",
        extern_fn(|itp, args| {
            let mut s = join_operands(args, true);
            s.push('\n');
            itp.ctx.write_output(s.as_bytes());
            Ok(Value::Tuple(vec![Value::Int(s.len() as i64), Value::Nil].into()))
        }),
    );
    pkg.func(
        "Print",
        extern_fn(|itp, args| {
            let s = join_operands(args, false);
            itp.ctx.write_output(s.as_bytes());
            Ok(Value::Tuple(vec![Value::Int(s.len() as i64), Value::Nil].into()))
        }),
    );
    pkg.func(
        "Sprint",
        extern_fn(|_itp, args| Ok(Value::from(join_operands(args, false)))),
    );
    ctx.register_package(pkg);
}

fn register_strconv(ctx: &Arc<Context>) {
    let mut pkg = Package::new("strconv", "strconv");
    pkg.func(
        "Itoa",
        extern_fn(|_itp, args| {
            let n = args[0].as_int()?;
            Ok(Value::from(n.to_string()))
        }),
    );
    pkg.func(
        "Atoi",
        extern_fn(|_itp, args| {
            let s = match args[0].unnamed() {
                Value::Str(s) => s.clone(),
                other => return Err(Panic::runtime(format!("Atoi of {}", other.kind_name()))),
            };
            match s.parse::<i64>() {
                Ok(n) => Ok(Value::Tuple(vec![Value::Int(n), Value::Nil].into())),
                Err(_) => Ok(Value::Tuple(
                    vec![
                        Value::Int(0),
                        Value::from(format!(
                            "strconv.Atoi: parsing {:?}: invalid syntax",
                            s.as_ref()
                        )),
                    ]
                    .into(),
                )),
            }
        }),
    );
    ctx.register_package(pkg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Mode;

    #[test]
    fn test_std_packages_installed() {
        let ctx = Context::new(Mode::NONE);
        assert!(ctx.registry().installed("os").is_some());
        assert!(ctx.registry().installed("fmt").is_some());
        assert!(ctx.registry().lookup_func("strconv", "Itoa").is_some());
    }
}
