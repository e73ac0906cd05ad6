//! Textual SSA format (.sgo files).
//!
//! A small line-oriented surface over the program builder so the CLI can
//! run and test programs without the out-of-scope frontend. Example:
//!
//! ```text
//! func Add(a int, b int) int {
//! b0:
//!   %s = add %a %b
//!   ret %s
//! }
//!
//! func main() {
//! b0:
//!   %r = call @Add 2 3
//!   $println %r
//!   ret
//! }
//! ```
//!
//! Operands are `%name` references, integer/float literals, quoted
//! strings, `true`/`false`, or `nil`. Callees are `@func` for declared
//! functions and `$name` for builtins. Blocks are labeled `bN:` in
//! order of declaration.

use std::collections::HashMap;
use std::sync::Arc;

use sago_ssa::instr::{BinOp, UnOp};
use sago_ssa::types::{builtin, ChanDir, Type, TypeStore};
use sago_ssa::{ConstValue, FuncBuilder, FuncId, ProgramBuilder, Program, ValueId};

pub fn parse_text(store: Arc<TypeStore>, src: &str) -> Result<Program, String> {
    let lines: Vec<&str> = src
        .lines()
        .map(|l| l.split(';').next().unwrap_or("").trim())
        .collect();

    let mut pb = ProgramBuilder::new(store.clone(), "main");

    // First pass: declare all functions so calls resolve forward.
    struct FuncSrc {
        id: FuncId,
        params: Vec<String>,
        body: Vec<String>,
    }
    let mut funcs: Vec<FuncSrc> = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        i += 1;
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("func ") {
            let (name, params, results) = parse_func_header(&store, rest)?;
            let param_types: Vec<Type> = params.iter().map(|(_, t)| *t).collect();
            let sig = store.signature(param_types, results, false);
            let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
            let id = pb.declare_func("main", &name, sig, &names);
            let mut body = Vec::new();
            while i < lines.len() && lines[i] != "}" {
                if !lines[i].is_empty() {
                    body.push(lines[i].to_string());
                }
                i += 1;
            }
            if i >= lines.len() {
                return Err(format!("func {}: missing closing brace", name));
            }
            i += 1; // consume "}"
            funcs.push(FuncSrc {
                id,
                params: params.into_iter().map(|(n, _)| n).collect(),
                body,
            });
        } else {
            return Err(format!("unexpected top-level line: {}", line));
        }
    }

    // Second pass: build bodies.
    for f in &funcs {
        let mut fb = pb.define_func(f.id);
        build_body(&store, &mut fb, &f.params, &f.body)?;
        fb.finish();
    }

    Ok(pb.finish())
}

fn parse_func_header(
    store: &TypeStore,
    rest: &str,
) -> Result<(String, Vec<(String, Type)>, Vec<Type>), String> {
    let open = rest.find('(').ok_or("func: missing (")?;
    let name = rest[..open].trim().to_string();
    let close = rest.find(')').ok_or("func: missing )")?;
    let params_src = &rest[open + 1..close];
    let mut params = Vec::new();
    for part in params_src.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (pname, ptyp) = part.split_once(' ').ok_or_else(|| format!("bad param: {}", part))?;
        params.push((pname.trim().to_string(), parse_type(store, ptyp.trim())?));
    }
    let tail = rest[close + 1..].trim().trim_end_matches('{').trim();
    let mut results = Vec::new();
    if !tail.is_empty() {
        let tail = tail.trim_start_matches('(').trim_end_matches(')');
        for part in tail.split(',') {
            let part = part.trim();
            if !part.is_empty() {
                results.push(parse_type(store, part)?);
            }
        }
    }
    Ok((name, params, results))
}

fn parse_type(store: &TypeStore, s: &str) -> Result<Type, String> {
    let s = s.trim();
    if let Some(elem) = s.strip_prefix("[]") {
        return Ok(store.slice(parse_type(store, elem)?));
    }
    if let Some(elem) = s.strip_prefix("chan ") {
        return Ok(store.chan(ChanDir::SendRecv, parse_type(store, elem)?));
    }
    if let Some(elem) = s.strip_prefix('*') {
        return Ok(store.pointer(parse_type(store, elem)?));
    }
    if let Some(kv) = s.strip_prefix("map[") {
        let close = kv.find(']').ok_or("map: missing ]")?;
        let key = parse_type(store, &kv[..close])?;
        let val = parse_type(store, &kv[close + 1..])?;
        return Ok(store.map(key, val));
    }
    match s {
        "int" => Ok(builtin::INT),
        "int8" => Ok(builtin::INT8),
        "int16" => Ok(builtin::INT16),
        "int32" | "rune" => Ok(builtin::INT32),
        "int64" => Ok(builtin::INT64),
        "uint" => Ok(builtin::UINT),
        "uint8" | "byte" => Ok(builtin::UINT8),
        "uint16" => Ok(builtin::UINT16),
        "uint32" => Ok(builtin::UINT32),
        "uint64" => Ok(builtin::UINT64),
        "float32" => Ok(builtin::FLOAT32),
        "float64" => Ok(builtin::FLOAT64),
        "string" => Ok(builtin::STRING),
        "bool" => Ok(builtin::BOOL),
        "any" => Ok(builtin::ANY),
        other => Err(format!("unknown type: {}", other)),
    }
}

fn binop_for(mnemonic: &str) -> Option<BinOp> {
    Some(match mnemonic {
        "add" => BinOp::Add,
        "sub" => BinOp::Sub,
        "mul" => BinOp::Mul,
        "div" => BinOp::Quo,
        "rem" => BinOp::Rem,
        "and" => BinOp::And,
        "or" => BinOp::Or,
        "xor" => BinOp::Xor,
        "andnot" => BinOp::AndNot,
        "shl" => BinOp::Shl,
        "shr" => BinOp::Shr,
        "lt" => BinOp::Lss,
        "le" => BinOp::Leq,
        "gt" => BinOp::Gtr,
        "ge" => BinOp::Geq,
        "eq" => BinOp::Eql,
        "ne" => BinOp::Neq,
        _ => return None,
    })
}

struct BodyCtx<'a, 'b> {
    fb: &'a mut FuncBuilder<'b>,
    names: HashMap<String, ValueId>,
    /// Phi edges whose value is defined later in the body:
    /// (phi, predecessor block, operand token).
    pending_edges: Vec<(ValueId, u32, String)>,
}

impl<'a, 'b> BodyCtx<'a, 'b> {
    fn operand(&mut self, tok: &str) -> Result<ValueId, String> {
        if let Some(name) = tok.strip_prefix('%') {
            return self
                .names
                .get(name)
                .copied()
                .ok_or_else(|| format!("unknown value %{}", name));
        }
        self.literal(tok)
    }

    fn literal(&mut self, tok: &str) -> Result<ValueId, String> {
        if tok == "nil" {
            return Ok(self.fb.const_of(builtin::UNTYPED_NIL, ConstValue::Nil));
        }
        if tok == "true" || tok == "false" {
            return Ok(self.fb.const_of(builtin::BOOL, ConstValue::Bool(tok == "true")));
        }
        if tok.starts_with('"') && tok.ends_with('"') && tok.len() >= 2 {
            let inner = tok[1..tok.len() - 1].replace("\\n", "\n").replace("\\\"", "\"");
            return Ok(self.fb.const_of(builtin::STRING, ConstValue::Str(inner)));
        }
        if tok.contains('.') {
            if let Ok(f) = tok.parse::<f64>() {
                return Ok(self.fb.const_of(builtin::FLOAT64, ConstValue::Float(f)));
            }
        }
        tok.parse::<i64>()
            .map(|n| self.fb.const_of(builtin::INT, ConstValue::Int(n)))
            .map_err(|_| format!("bad operand: {}", tok))
    }
}

fn tokenize(line: &str) -> Vec<String> {
    let mut toks = Vec::new();
    let mut cur = String::new();
    let mut in_str = false;
    for ch in line.chars() {
        match ch {
            '"' => {
                in_str = !in_str;
                cur.push(ch);
            }
            c if c.is_whitespace() && !in_str => {
                if !cur.is_empty() {
                    toks.push(std::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        toks.push(cur);
    }
    toks
}

fn build_body(
    store: &Arc<TypeStore>,
    fb: &mut FuncBuilder<'_>,
    params: &[String],
    body: &[String],
) -> Result<(), String> {
    let mut ctx = BodyCtx { fb, names: HashMap::new(), pending_edges: Vec::new() };
    for (i, p) in params.iter().enumerate() {
        let v = ctx.fb.param(i);
        ctx.names.insert(p.clone(), v);
    }

    // Pre-create blocks so forward branches resolve; labels must appear
    // in ascending order (b0 is the entry block).
    let label_count = body.iter().filter(|l| is_label(l)).count();
    for _ in 1..label_count.max(1) {
        ctx.fb.new_block();
    }
    ctx.fb.switch_to(0);

    for line in body {
        if let Some(label) = parse_label(line) {
            ctx.fb.switch_to(label);
            continue;
        }
        let toks = tokenize(line);
        if toks.is_empty() {
            continue;
        }
        if toks[0].starts_with('%') && toks.get(1).map(|t| t.as_str()) == Some("=") {
            let dest = toks[0][1..].to_string();
            let v = build_value_instr(store, &mut ctx, &toks[2..])?;
            ctx.names.insert(dest, v);
        } else {
            build_effect_instr(store, &mut ctx, &toks)?;
        }
    }

    // Resolve loop back-edges now that every value exists.
    let pending = std::mem::take(&mut ctx.pending_edges);
    for (phi, pred, tok) in pending {
        let v = ctx.operand(&tok)?;
        ctx.fb.add_phi_edge(phi, pred, v);
    }
    Ok(())
}

fn is_label(line: &str) -> bool {
    parse_label(line).is_some()
}

fn parse_label(line: &str) -> Option<u32> {
    let rest = line.strip_prefix('b')?.strip_suffix(':')?;
    rest.parse().ok()
}

fn build_value_instr(
    store: &Arc<TypeStore>,
    ctx: &mut BodyCtx<'_, '_>,
    toks: &[String],
) -> Result<ValueId, String> {
    let op = toks[0].as_str();
    if let Some(b) = binop_for(op) {
        let x = ctx.operand(&toks[1])?;
        let y = ctx.operand(&toks[2])?;
        return Ok(ctx.fb.binop(b, x, y));
    }
    match op {
        "neg" | "not" | "bnot" => {
            let x = ctx.operand(&toks[1])?;
            let u = match op {
                "neg" => UnOp::Neg,
                "not" => UnOp::Not,
                _ => UnOp::Xor,
            };
            Ok(ctx.fb.unop(u, x, false))
        }
        "phi" => {
            // phi [b0 %a] [b1 %b]; loop back-edges may name values defined
            // later in the body, resolved after the last line.
            let mut edges = Vec::new();
            let mut pending: Vec<(u32, String)> = Vec::new();
            let mut k = 1;
            while k + 1 < toks.len() {
                let b = toks[k]
                    .trim_start_matches('[')
                    .trim_start_matches('b')
                    .parse::<u32>()
                    .map_err(|_| format!("phi: bad block {}", toks[k]))?;
                let tok = toks[k + 1].trim_end_matches(']');
                match ctx.operand(tok) {
                    Ok(v) => edges.push((b, v)),
                    Err(_) if tok.starts_with('%') => pending.push((b, tok.to_string())),
                    Err(e) => return Err(e),
                }
                k += 2;
            }
            let phi = ctx.fb.phi(builtin::INT, edges);
            for (b, tok) in pending {
                ctx.pending_edges.push((phi, b, tok));
            }
            Ok(phi)
        }
        "call" => {
            let callee = &toks[1];
            let mut args = Vec::new();
            for t in &toks[2..] {
                args.push(ctx.operand(t)?);
            }
            build_call(ctx, callee, args)
        }
        "recv" | "recvok" => {
            let ch = ctx.operand(&toks[1])?;
            Ok(ctx.fb.unop(UnOp::Recv, ch, op == "recvok"))
        }
        "makechan" => {
            let size = ctx.operand(&toks[1])?;
            let elem = if toks.len() > 2 {
                parse_type(store, &toks[2])?
            } else {
                builtin::INT
            };
            let typ = store.chan(ChanDir::SendRecv, elem);
            Ok(ctx.fb.make_chan(typ, size))
        }
        "makemap" => {
            let key = parse_type(store, &toks[1])?;
            let val = parse_type(store, &toks[2])?;
            Ok(ctx.fb.make_map(store.map(key, val), None))
        }
        "makeslice" => {
            let elem = parse_type(store, &toks[1])?;
            let len = ctx.operand(&toks[2])?;
            let cap = ctx.operand(&toks[3])?;
            Ok(ctx.fb.make_slice(store.slice(elem), len, cap))
        }
        "alloc" => {
            let ty = parse_type(store, &toks[1])?;
            Ok(ctx.fb.alloc(ty, true))
        }
        "load" => {
            let p = ctx.operand(&toks[1])?;
            Ok(ctx.fb.unop(UnOp::Deref, p, false))
        }
        "lookup" | "lookupok" => {
            let m = ctx.operand(&toks[1])?;
            let k = ctx.operand(&toks[2])?;
            Ok(ctx.fb.lookup(m, k, op == "lookupok"))
        }
        "extract" => {
            let t = ctx.operand(&toks[1])?;
            let idx: usize = toks[2].parse().map_err(|_| "extract: bad index")?;
            Ok(ctx.fb.extract(t, idx))
        }
        other => Err(format!("unknown instruction: {}", other)),
    }
}

fn build_call(
    ctx: &mut BodyCtx<'_, '_>,
    callee: &str,
    args: Vec<ValueId>,
) -> Result<ValueId, String> {
    if let Some(name) = callee.strip_prefix('$') {
        return Ok(ctx.fb.call_builtin(name, args, builtin::INT));
    }
    if let Some(name) = callee.strip_prefix('@') {
        let f = ctx
            .fb
            .func_ref(name)
            .ok_or_else(|| format!("unknown function @{}", name))?;
        return Ok(ctx.fb.call(f, args));
    }
    // A %value callee: dynamic call.
    let f = ctx
        .names
        .get(callee.trim_start_matches('%'))
        .copied()
        .ok_or_else(|| format!("unknown callee {}", callee))?;
    Ok(ctx.fb.call(f, args))
}

fn build_effect_instr(
    store: &Arc<TypeStore>,
    ctx: &mut BodyCtx<'_, '_>,
    toks: &[String],
) -> Result<(), String> {
    match toks[0].as_str() {
        "jmp" => {
            let b = toks[1]
                .trim_start_matches('b')
                .parse::<u32>()
                .map_err(|_| "jmp: bad block")?;
            ctx.fb.jump(b);
            Ok(())
        }
        "br" => {
            let c = ctx.operand(&toks[1])?;
            let t = toks[2].trim_start_matches('b').parse::<u32>().map_err(|_| "br: bad block")?;
            let e = toks[3].trim_start_matches('b').parse::<u32>().map_err(|_| "br: bad block")?;
            ctx.fb.br(c, t, e);
            Ok(())
        }
        "ret" => {
            let mut rs = Vec::new();
            for t in &toks[1..] {
                rs.push(ctx.operand(t)?);
            }
            ctx.fb.ret(rs);
            Ok(())
        }
        "send" => {
            let ch = ctx.operand(&toks[1])?;
            let v = ctx.operand(&toks[2])?;
            ctx.fb.send(ch, v);
            Ok(())
        }
        "store" => {
            let p = ctx.operand(&toks[1])?;
            let v = ctx.operand(&toks[2])?;
            ctx.fb.store_value(p, v);
            Ok(())
        }
        "mapset" => {
            let m = ctx.operand(&toks[1])?;
            let k = ctx.operand(&toks[2])?;
            let v = ctx.operand(&toks[3])?;
            ctx.fb.map_update(m, k, v);
            Ok(())
        }
        "panic" => {
            let v = ctx.operand(&toks[1])?;
            ctx.fb.panic_value(v);
            Ok(())
        }
        "rundefers" => {
            ctx.fb.run_defers();
            Ok(())
        }
        "go" | "defer" => {
            let is_go = toks[0] == "go";
            let callee = &toks[1];
            let mut args = Vec::new();
            for t in &toks[2..] {
                args.push(ctx.operand(t)?);
            }
            if let Some(name) = callee.strip_prefix('$') {
                if is_go {
                    return Err("go of builtin not supported in text form".to_string());
                }
                ctx.fb.defer_builtin(name, args);
                return Ok(());
            }
            let f = if let Some(name) = callee.strip_prefix('@') {
                ctx.fb
                    .func_ref(name)
                    .ok_or_else(|| format!("unknown function @{}", name))?
            } else {
                ctx.operand(callee)?
            };
            if is_go {
                ctx.fb.go_call(f, args);
            } else {
                ctx.fb.defer_call(f, args);
            }
            Ok(())
        }
        callee if callee.starts_with('$') => {
            // Bare builtin statement: `$println %x`.
            let mut args = Vec::new();
            for t in &toks[1..] {
                args.push(ctx.operand(t)?);
            }
            ctx.fb.call_builtin(&callee[1..], args, builtin::INT);
            Ok(())
        }
        callee if callee.starts_with('@') => {
            let mut args = Vec::new();
            for t in &toks[1..] {
                args.push(ctx.operand(t)?);
            }
            build_call(ctx, callee, args)?;
            Ok(())
        }
        other => Err(format!("unknown statement: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_program() {
        let store = Arc::new(TypeStore::new());
        let src = r#"
func Add(a int, b int) int {
b0:
  %s = add %a %b
  ret %s
}

func main() {
b0:
  %r = call @Add 2 3
  ret
}
"#;
        let prog = parse_text(store, src).unwrap();
        assert!(prog.func_by_name("Add").is_some());
        assert!(prog.func_by_name("main").is_some());
    }

    #[test]
    fn test_parse_errors() {
        let store = Arc::new(TypeStore::new());
        assert!(parse_text(store.clone(), "garbage").is_err());
        let src = "func f() {\nb0:\n  %x = call @missing\n  ret\n}";
        assert!(parse_text(store, src).is_err());
    }

    #[test]
    fn test_parse_loop_with_back_edge() {
        let store = Arc::new(TypeStore::new());
        let src = r#"
func sum(n int) int {
b0:
  jmp b1
b1:
  %i = phi [b0 0] [b2 %i2]
  %s = phi [b0 0] [b2 %s2]
  %c = lt %i %n
  br %c b2 b3
b2:
  %s2 = add %s %i
  %i2 = add %i 1
  jmp b1
b3:
  ret %s
}
"#;
        let prog = parse_text(store, src).unwrap();
        let f = prog.func_by_name("sum").unwrap();
        assert_eq!(f.blocks.len(), 4);
        // Both phis carry the entry edge and the loop back-edge.
        let phis: Vec<_> = f.blocks[1]
            .instrs
            .iter()
            .filter_map(|i| match i {
                sago_ssa::Instr::Phi { edges, .. } => Some(edges.len()),
                _ => None,
            })
            .collect();
        assert_eq!(phis, vec![2, 2]);
    }

    #[test]
    fn test_type_parser() {
        let store = TypeStore::new();
        assert_eq!(parse_type(&store, "int").unwrap(), builtin::INT);
        let t = parse_type(&store, "[]int").unwrap();
        assert_eq!(t, store.slice(builtin::INT));
        let t = parse_type(&store, "map[string]int").unwrap();
        assert_eq!(t, store.map(builtin::STRING, builtin::INT));
        assert!(parse_type(&store, "wat").is_err());
    }
}
