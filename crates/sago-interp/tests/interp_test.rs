//! End-to-end tests: programs built through the SSA builder, run through
//! the context.

use std::sync::Arc;

use parking_lot::Mutex;

use sago_interp::{Context, Error, Mode, OutputBuffer, Value};
use sago_ssa::instr::{BinOp, SelectState, UnOp};
use sago_ssa::types::{builtin as ty, ChanDir, Field, Type};
use sago_ssa::{ConstValue, Program, ProgramBuilder, ValueId};

fn run(ctx: &Arc<Context>, prog: &Arc<Program>) -> (i32, Option<Error>) {
    ctx.run_program(prog, "main")
}

fn capture_output(ctx: &Arc<Context>) -> OutputBuffer {
    let buf: OutputBuffer = Arc::new(Mutex::new(Vec::new()));
    ctx.set_print_output(buf.clone());
    buf
}

fn output_string(buf: &OutputBuffer) -> String {
    String::from_utf8_lossy(&buf.lock()).into_owned()
}

/// Emit `panic(v)` boxed as an interface value.
fn emit_panic(fb: &mut sago_ssa::FuncBuilder<'_>, v: ValueId) {
    let boxed = fb.make_interface(ty::ANY, v);
    fb.panic_value(boxed);
}

/// A `struct{n1, n2 int}` value built in-frame: alloc, store fields, load.
fn emit_struct2(
    fb: &mut sago_ssa::FuncBuilder<'_>,
    st: Type,
    f0: ValueId,
    f1: ValueId,
) -> ValueId {
    let ptr = fb.alloc(st, false);
    let a0 = fb.field_addr(ptr, 0);
    fb.store_value(a0, f0);
    let a1 = fb.field_addr(ptr, 1);
    fb.store_value(a1, f1);
    fb.unop(UnOp::Deref, ptr, false)
}

// S1: a counting loop summing a struct method's results.
#[test]
fn test_method_call_loop() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let t_struct = store.struct_of(vec![Field::new("n1", ty::INT), Field::new("n2", ty::INT)]);
    let t = store.named("main", "T", t_struct);

    let call_sig = store.signature(vec![t], vec![ty::INT], false);
    let call_fid = pb.declare_method(t, "call", call_sig, &["t"]);

    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);

    let c0 = pb.const_int(0);
    let c1 = pb.const_int(1);
    let c3 = pb.const_int(3);
    let c9 = pb.const_int(9);

    {
        let mut fb = pb.define_func(call_fid);
        let tv = fb.param(0);
        let n1 = fb.field(tv, 0);
        let n2 = fb.field(tv, 1);
        let m = fb.binop(BinOp::Mul, n1, n2);
        fb.ret(vec![m]);
        fb.finish();
    }
    {
        let mut fb = pb.define_func(main_fid);
        let header = fb.new_block();
        let body = fb.new_block();
        let exit = fb.new_block();
        let ok_b = fb.new_block();
        let bad_b = fb.new_block();

        fb.jump(header);

        fb.switch_to(header);
        let i = fb.phi(ty::INT, vec![(0, c0)]);
        let n = fb.phi(ty::INT, vec![(0, c0)]);
        let cond = fb.binop(BinOp::Lss, i, c3);
        fb.br(cond, body, exit);

        fb.switch_to(body);
        let tv = emit_struct2(&mut fb, t, i, c3);
        let callee = fb.func_value(call_fid);
        let r = fb.call(callee, vec![tv]);
        let sum = fb.binop(BinOp::Add, n, r);
        let inc = fb.binop(BinOp::Add, i, c1);
        fb.jump(header);
        fb.add_phi_edge(i, body, inc);
        fb.add_phi_edge(n, body, sum);

        fb.switch_to(exit);
        let bad = fb.binop(BinOp::Neq, n, c9);
        fb.br(bad, bad_b, ok_b);

        fb.switch_to(ok_b);
        fb.ret(vec![]);

        fb.switch_to(bad_b);
        emit_panic(&mut fb, n);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert!(err.is_none(), "unexpected error: {:?}", err.map(|e| e.to_string()));
    assert_eq!(code, 0);
}

// S2: os.Exit(-2) becomes the exit code, with no error.
#[test]
fn test_os_exit() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let exit_sig = store.signature(vec![ty::INT], vec![], false);
    let os_exit = pb.declare_func("os", "Exit", exit_sig, &["code"]);

    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);
    let cneg = pb.const_int(-2);
    {
        let mut fb = pb.define_func(main_fid);
        let callee = fb.func_value(os_exit);
        fb.call(callee, vec![cneg]);
        fb.ret(vec![]);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert!(err.is_none());
    assert_eq!(code, -2);
}

// S3: an override intercepts a function that has a body; clearing it
// restores the interpreted body.
#[test]
fn test_override_function() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let call_sig = store.signature(vec![ty::INT, ty::INT], vec![ty::INT], false);
    let call_fid = pb.declare_func("main", "call", call_sig, &["i", "j"]);

    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);

    let c10 = pb.const_int(10);
    let c20 = pb.const_int(20);
    let c200 = pb.const_int(200);

    {
        let mut fb = pb.define_func(call_fid);
        let (i, j) = (fb.param(0), fb.param(1));
        let s = fb.binop(BinOp::Add, i, j);
        fb.ret(vec![s]);
        fb.finish();
    }
    {
        let mut fb = pb.define_func(main_fid);
        let ok_b = fb.new_block();
        let bad_b = fb.new_block();
        let callee = fb.func_value(call_fid);
        let n = fb.call(callee, vec![c10, c20]);
        let bad = fb.binop(BinOp::Neq, n, c200);
        fb.br(bad, bad_b, ok_b);
        fb.switch_to(ok_b);
        fb.ret(vec![]);
        fb.switch_to(bad_b);
        emit_panic(&mut fb, n);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());

    ctx.set_override_function("main.call", |_itp, args| {
        Ok(Value::Int(args[0].as_int()? * args[1].as_int()?))
    });
    let (code, err) = run(&ctx, &prog);
    assert!(err.is_none(), "override run failed: {:?}", err.map(|e| e.to_string()));
    assert_eq!(code, 0);

    ctx.clear_override_function("main.call");
    let (code, err) = run(&ctx, &prog);
    assert_eq!(code, 2);
    match err {
        Some(Error::Panic(Value::Int(30))) => {}
        other => panic!("expected panic with 30, got {:?}", other.map(|e| e.to_string())),
    }
}

// S4: a deferred call recovers a panic and prints its value.
#[test]
fn test_recover_prints_value() {
    let ctx = Context::new(Mode::NONE);
    let buf = capture_output(&ctx);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let void = store.signature(vec![], vec![], false);
    let helper_fid = pb.declare_func("main", "helper", void, &[]);
    let main_fid = pb.declare_func("main", "main", void, &[]);
    let boom = pb.const_str("boom");

    {
        let mut fb = pb.define_func(helper_fid);
        let r = fb.call_builtin("recover", vec![], ty::ANY);
        fb.call_builtin("println", vec![r], ty::INT);
        fb.ret(vec![]);
        fb.finish();
    }
    {
        let mut fb = pb.define_func(main_fid);
        let callee = fb.func_value(helper_fid);
        fb.defer_call(callee, vec![]);
        emit_panic(&mut fb, boom);
        let rb = fb.new_block();
        fb.switch_to(rb);
        fb.ret(vec![]);
        fb.set_recover_block(rb);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert!(err.is_none(), "unexpected error: {:?}", err.map(|e| e.to_string()));
    assert_eq!(code, 0);
    assert_eq!(output_string(&buf), "boom\n");
}

// S5: one goroutine sends 100 integers into a buffered channel, the main
// goroutine sums them after close.
#[test]
fn test_channel_sum() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let chan_ty = store.chan(ChanDir::SendRecv, ty::INT);
    let prod_sig = store.signature(vec![chan_ty], vec![], false);
    let prod_fid = pb.declare_func("main", "producer", prod_sig, &["ch"]);

    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);

    let c0 = pb.const_int(0);
    let c1 = pb.const_int(1);
    let c100 = pb.const_int(100);
    let c4950 = pb.const_int(4950);

    {
        let mut fb = pb.define_func(prod_fid);
        let ch = fb.param(0);
        let header = fb.new_block();
        let body = fb.new_block();
        let done = fb.new_block();

        fb.jump(header);

        fb.switch_to(header);
        let i = fb.phi(ty::INT, vec![(0, c0)]);
        let cond = fb.binop(BinOp::Lss, i, c100);
        fb.br(cond, body, done);

        fb.switch_to(body);
        fb.send(ch, i);
        let inc = fb.binop(BinOp::Add, i, c1);
        fb.jump(header);
        fb.add_phi_edge(i, body, inc);

        fb.switch_to(done);
        fb.call_builtin("close", vec![ch], ty::INT);
        fb.ret(vec![]);
        fb.finish();
    }
    {
        let mut fb = pb.define_func(main_fid);
        let header = fb.new_block();
        let accum = fb.new_block();
        let check = fb.new_block();
        let ok_b = fb.new_block();
        let bad_b = fb.new_block();

        let ch = fb.make_chan(chan_ty, c100);
        let callee = fb.func_value(prod_fid);
        fb.go_call(callee, vec![ch]);
        fb.jump(header);

        fb.switch_to(header);
        let sum = fb.phi(ty::INT, vec![(0, c0)]);
        let t = fb.unop(UnOp::Recv, ch, true);
        let v = fb.extract(t, 0);
        let ok = fb.extract(t, 1);
        fb.br(ok, accum, check);

        fb.switch_to(accum);
        let sum2 = fb.binop(BinOp::Add, sum, v);
        fb.jump(header);
        fb.add_phi_edge(sum, accum, sum2);

        fb.switch_to(check);
        let bad = fb.binop(BinOp::Neq, sum, c4950);
        fb.br(bad, bad_b, ok_b);
        fb.switch_to(ok_b);
        fb.ret(vec![]);
        fb.switch_to(bad_b);
        emit_panic(&mut fb, sum);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert!(err.is_none(), "unexpected error: {:?}", err.map(|e| e.to_string()));
    assert_eq!(code, 0);
}

// S6: a failed single-value type assertion is a runtime error mentioning
// the interface conversion.
#[test]
fn test_type_assert_failure() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);
    let c42 = pb.const_int(42);
    {
        let mut fb = pb.define_func(main_fid);
        let boxed = fb.make_interface(ty::ANY, c42);
        fb.type_assert(boxed, ty::STRING, false);
        fb.ret(vec![]);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert_eq!(code, 2);
    match err {
        Some(Error::Runtime(e)) => {
            assert!(e.to_string().contains("interface conversion"), "message: {}", e)
        }
        other => panic!("expected runtime error, got {:?}", other.map(|e| e.to_string())),
    }
}

// Property 3: defers run in reverse insertion order, with and without a
// panic in flight.
#[test]
fn test_defer_lifo() {
    for panics in [false, true] {
        let ctx = Context::new(Mode::NONE);
        let buf = capture_output(&ctx);
        let store = ctx.type_store();
        let mut pb = ProgramBuilder::new(store.clone(), "main");

        let main_sig = store.signature(vec![], vec![], false);
        let main_fid = pb.declare_func("main", "main", main_sig, &[]);
        let s1 = pb.const_str("first");
        let s2 = pb.const_str("second");
        let s3 = pb.const_str("third");
        let bang = pb.const_str("bang");
        {
            let mut fb = pb.define_func(main_fid);
            fb.defer_builtin("println", vec![s1]);
            fb.defer_builtin("println", vec![s2]);
            fb.defer_builtin("println", vec![s3]);
            if panics {
                emit_panic(&mut fb, bang);
            } else {
                fb.run_defers();
                fb.ret(vec![]);
            }
            fb.finish();
        }

        let prog = Arc::new(pb.finish());
        let (code, err) = run(&ctx, &prog);
        if panics {
            assert_eq!(code, 2);
            assert!(matches!(err, Some(Error::Panic(_))));
        } else {
            assert_eq!(code, 0);
            assert!(err.is_none());
        }
        assert_eq!(output_string(&buf), "third\nsecond\nfirst\n");
    }
}

// Property 4: recover() outside a deferred call of a panicking frame
// yields nil; one extra call level also yields nil.
#[test]
fn test_recover_depth() {
    let ctx = Context::new(Mode::NONE);
    let buf = capture_output(&ctx);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let void = store.signature(vec![], vec![], false);
    // g: the too-deep recover, called from the deferred f.
    let g_fid = pb.declare_func("main", "g", void, &[]);
    let f_fid = pb.declare_func("main", "f", void, &[]);
    let main_fid = pb.declare_func("main", "main", void, &[]);
    let bang = pb.const_str("bang");

    {
        let mut fb = pb.define_func(g_fid);
        let r = fb.call_builtin("recover", vec![], ty::ANY);
        fb.call_builtin("println", vec![r], ty::INT);
        fb.ret(vec![]);
        fb.finish();
    }
    {
        let mut fb = pb.define_func(f_fid);
        let callee = fb.func_value(g_fid);
        fb.call(callee, vec![]);
        fb.ret(vec![]);
        fb.finish();
    }
    {
        let mut fb = pb.define_func(main_fid);
        // A top-level recover with no panic in flight: nil.
        let r = fb.call_builtin("recover", vec![], ty::ANY);
        fb.call_builtin("println", vec![r], ty::INT);
        let callee = fb.func_value(f_fid);
        fb.defer_call(callee, vec![]);
        emit_panic(&mut fb, bang);
        let rb = fb.new_block();
        fb.switch_to(rb);
        fb.ret(vec![]);
        fb.set_recover_block(rb);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    // g's recover is one level too deep, so the panic escapes.
    assert_eq!(code, 2);
    assert!(matches!(err, Some(Error::Panic(_))));
    assert_eq!(output_string(&buf), "<nil>\n<nil>\n");
}

// Property 5: map lookup with comma-ok.
#[test]
fn test_map_comma_ok() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let map_ty = store.map(ty::STRING, ty::INT);
    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);
    let key = pb.const_str("a");
    let c0 = pb.const_int(0);
    let c5 = pb.const_int(5);
    {
        let mut fb = pb.define_func(main_fid);
        let after_absent = fb.new_block();
        let after_present = fb.new_block();
        let bad_b = fb.new_block();

        let m = fb.make_map(map_ty, None);
        let t = fb.lookup(m, key, true);
        let v = fb.extract(t, 0);
        let ok = fb.extract(t, 1);
        // absent: v == 0 && !ok
        let vz = fb.binop(BinOp::Eql, v, c0);
        let not_ok = fb.unop(UnOp::Not, ok, false);
        let both = fb.binop(BinOp::Eql, vz, not_ok);
        fb.br(both, after_absent, bad_b);

        fb.switch_to(after_absent);
        fb.map_update(m, key, c5);
        let t2 = fb.lookup(m, key, true);
        let v2 = fb.extract(t2, 0);
        let ok2 = fb.extract(t2, 1);
        let vok = fb.binop(BinOp::Eql, v2, c5);
        let got = fb.binop(BinOp::Eql, vok, ok2);
        fb.br(got, after_present, bad_b);

        fb.switch_to(after_present);
        fb.ret(vec![]);

        fb.switch_to(bad_b);
        emit_panic(&mut fb, v);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert!(err.is_none(), "unexpected error: {:?}", err.map(|e| e.to_string()));
    assert_eq!(code, 0);
}

// Property 6: a zero-valued slice compares equal to nil.
#[test]
fn test_nil_comparison() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let slice_ty = store.slice(ty::INT);
    let mk_sig = store.signature(vec![], vec![slice_ty], false);
    let mk_fid = pb.declare_func("main", "mk", mk_sig, &[]);
    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);
    let nil_ret = pb.const_nil(slice_ty);
    let nil_cmp = pb.const_nil(ty::UNTYPED_NIL);
    {
        let mut fb = pb.define_func(mk_fid);
        fb.ret(vec![nil_ret]);
        fb.finish();
    }
    {
        let mut fb = pb.define_func(main_fid);
        let ok_b = fb.new_block();
        let bad_b = fb.new_block();
        let callee = fb.func_value(mk_fid);
        let s = fb.call(callee, vec![]);
        let is_nil = fb.binop(BinOp::Eql, s, nil_cmp);
        fb.br(is_nil, ok_b, bad_b);
        fb.switch_to(ok_b);
        fb.ret(vec![]);
        fb.switch_to(bad_b);
        emit_panic(&mut fb, is_nil);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert!(err.is_none(), "unexpected error: {:?}", err.map(|e| e.to_string()));
    assert_eq!(code, 0);
}

// Property 7: keys of a struct type with a blank field collapse to one
// equivalence class.
#[test]
fn test_blank_field_map_keys() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let k_struct = store.struct_of(vec![Field::new("x", ty::INT), Field::new("_", ty::INT)]);
    let k = store.named("main", "K", k_struct);
    let map_ty = store.map(k, ty::INT);

    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);
    let c1 = pb.const_int(1);
    let c2 = pb.const_int(2);
    let c10 = pb.const_int(10);
    let c20 = pb.const_int(20);
    let c30 = pb.const_int(30);
    {
        let mut fb = pb.define_func(main_fid);
        let len_ok = fb.new_block();
        let all_ok = fb.new_block();
        let bad_b = fb.new_block();

        let m = fb.make_map(map_ty, None);
        let k1 = emit_struct2(&mut fb, k, c1, c10);
        fb.map_update(m, k1, c1);
        let k2 = emit_struct2(&mut fb, k, c1, c20);
        fb.map_update(m, k2, c2);

        let n = fb.call_builtin("len", vec![m], ty::INT);
        let one = fb.binop(BinOp::Eql, n, c1);
        fb.br(one, len_ok, bad_b);

        fb.switch_to(len_ok);
        let k3 = emit_struct2(&mut fb, k, c1, c30);
        let t = fb.lookup(m, k3, true);
        let v = fb.extract(t, 0);
        let ok = fb.extract(t, 1);
        let v2 = fb.binop(BinOp::Eql, v, c2);
        let both = fb.binop(BinOp::Eql, v2, ok);
        fb.br(both, all_ok, bad_b);

        fb.switch_to(all_ok);
        fb.ret(vec![]);

        fb.switch_to(bad_b);
        emit_panic(&mut fb, n);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert!(err.is_none(), "unexpected error: {:?}", err.map(|e| e.to_string()));
    assert_eq!(code, 0);
}

// A store through the address of a blank field compiles to no step; the
// blank slot keeps its zero and neighboring fields are unaffected.
#[test]
fn test_store_to_blank_field_elided() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let st = store.struct_of(vec![Field::new("_", ty::INT), Field::new("x", ty::INT)]);
    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);
    let c0 = pb.const_int(0);
    let c7 = pb.const_int(7);
    let c9 = pb.const_int(9);
    {
        let mut fb = pb.define_func(main_fid);
        let ok_b = fb.new_block();
        let bad_b = fb.new_block();

        let ptr = fb.alloc(st, false);
        let blank_addr = fb.field_addr(ptr, 0);
        fb.store_value(blank_addr, c7);
        let x_addr = fb.field_addr(ptr, 1);
        fb.store_value(x_addr, c9);

        let sv = fb.unop(UnOp::Deref, ptr, false);
        let blank = fb.field(sv, 0);
        let x = fb.field(sv, 1);
        let blank_zero = fb.binop(BinOp::Eql, blank, c0);
        let x_stored = fb.binop(BinOp::Eql, x, c9);
        let both = fb.binop(BinOp::Eql, blank_zero, x_stored);
        fb.br(both, ok_b, bad_b);

        fb.switch_to(ok_b);
        fb.ret(vec![]);

        fb.switch_to(bad_b);
        emit_panic(&mut fb, blank);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let interp = ctx.new_interp(&prog).unwrap();

    // Only the store to the named field survives compilation.
    let main_id = prog.func_by_name("main").unwrap().id;
    let pfn = interp.load_function(main_id);
    let body = pfn.body(&interp).unwrap();
    let stores = body.descs.iter().filter(|d| d.as_str() == "store").count();
    assert_eq!(stores, 1);

    let (code, err) = interp.run_main("main");
    assert!(err.is_none(), "unexpected error: {:?}", err.map(|e| e.to_string()));
    assert_eq!(code, 0);
}

// Property 8: a non-blocking select with no ready case takes the default
// branch (chosen = -1); a blocking select returns the ready case.
#[test]
fn test_select_default_and_ready() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let chan_ty = store.chan(ChanDir::SendRecv, ty::INT);
    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);
    let c1 = pb.const_int(1);
    let c7 = pb.const_int(7);
    let cm1 = pb.const_int(-1);
    let c0 = pb.const_int(0);
    {
        let mut fb = pb.define_func(main_fid);
        let after_default = fb.new_block();
        let after_ready = fb.new_block();
        let bad_b = fb.new_block();

        let ch = fb.make_chan(chan_ty, c1);
        let sel = fb.select(vec![SelectState { chan: ch, send: None }], false);
        let chosen = fb.extract(sel, 0);
        let took_default = fb.binop(BinOp::Eql, chosen, cm1);
        fb.br(took_default, after_default, bad_b);

        fb.switch_to(after_default);
        fb.send(ch, c7);
        let sel2 = fb.select(vec![SelectState { chan: ch, send: None }], true);
        let chosen2 = fb.extract(sel2, 0);
        let got = fb.extract(sel2, 2);
        let is_zero = fb.binop(BinOp::Eql, chosen2, c0);
        let is_seven = fb.binop(BinOp::Eql, got, c7);
        let both = fb.binop(BinOp::Eql, is_zero, is_seven);
        fb.br(both, after_ready, bad_b);

        fb.switch_to(after_ready);
        fb.ret(vec![]);

        fb.switch_to(bad_b);
        emit_panic(&mut fb, chosen);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert!(err.is_none(), "unexpected error: {:?}", err.map(|e| e.to_string()));
    assert_eq!(code, 0);
}

// Closures capture their environment; calling one goes through the
// dynamic function-value path.
#[test]
fn test_closure_capture() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let inner_sig = store.signature(vec![ty::INT], vec![ty::INT], false);
    let inner_fid = pb.declare_func("main", "adder$1", inner_sig, &["y"]);
    let x_fv = pb.free_var(inner_fid, ty::INT, "x");

    let adder_sig = store.signature(vec![ty::INT], vec![inner_sig], false);
    let adder_fid = pb.declare_func("main", "adder", adder_sig, &["x"]);

    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);
    let c5 = pb.const_int(5);
    let c10 = pb.const_int(10);
    let c15 = pb.const_int(15);

    {
        let mut fb = pb.define_func(inner_fid);
        let y = fb.param(0);
        let s = fb.binop(BinOp::Add, x_fv, y);
        fb.ret(vec![s]);
        fb.finish();
    }
    {
        let mut fb = pb.define_func(adder_fid);
        let x = fb.param(0);
        let cl = fb.make_closure(inner_fid, vec![x]);
        fb.ret(vec![cl]);
        fb.finish();
    }
    {
        let mut fb = pb.define_func(main_fid);
        let ok_b = fb.new_block();
        let bad_b = fb.new_block();
        let callee = fb.func_value(adder_fid);
        let f = fb.call(callee, vec![c10]);
        let r = fb.call(f, vec![c5]);
        let good = fb.binop(BinOp::Eql, r, c15);
        fb.br(good, ok_b, bad_b);
        fb.switch_to(ok_b);
        fb.ret(vec![]);
        fb.switch_to(bad_b);
        emit_panic(&mut fb, r);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert!(err.is_none(), "unexpected error: {:?}", err.map(|e| e.to_string()));
    assert_eq!(code, 0);
}

// Frame pooling past the warm-up threshold does not change behavior.
#[test]
fn test_frame_pool_warmup() {
    let ctx = Context::new(Mode::NONE);
    ctx.set_least_call_for_enable_pool(8);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let dbl_sig = store.signature(vec![ty::INT], vec![ty::INT], false);
    let dbl_fid = pb.declare_func("main", "double", dbl_sig, &["x"]);
    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);
    let c0 = pb.const_int(0);
    let c1 = pb.const_int(1);
    let c2 = pb.const_int(2);
    let c200 = pb.const_int(200);
    let want = pb.const_int(39800); // sum of 2*i for i < 200
    {
        let mut fb = pb.define_func(dbl_fid);
        let x = fb.param(0);
        let d = fb.binop(BinOp::Mul, x, c2);
        fb.ret(vec![d]);
        fb.finish();
    }
    {
        let mut fb = pb.define_func(main_fid);
        let header = fb.new_block();
        let body = fb.new_block();
        let exit = fb.new_block();
        let ok_b = fb.new_block();
        let bad_b = fb.new_block();

        fb.jump(header);
        fb.switch_to(header);
        let i = fb.phi(ty::INT, vec![(0, c0)]);
        let sum = fb.phi(ty::INT, vec![(0, c0)]);
        let cond = fb.binop(BinOp::Lss, i, c200);
        fb.br(cond, body, exit);

        fb.switch_to(body);
        let callee = fb.func_value(dbl_fid);
        let d = fb.call(callee, vec![i]);
        let sum2 = fb.binop(BinOp::Add, sum, d);
        let inc = fb.binop(BinOp::Add, i, c1);
        fb.jump(header);
        fb.add_phi_edge(i, body, inc);
        fb.add_phi_edge(sum, body, sum2);

        fb.switch_to(exit);
        let good = fb.binop(BinOp::Eql, sum, want);
        fb.br(good, ok_b, bad_b);
        fb.switch_to(ok_b);
        fb.ret(vec![]);
        fb.switch_to(bad_b);
        emit_panic(&mut fb, sum);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert!(err.is_none(), "unexpected error: {:?}", err.map(|e| e.to_string()));
    assert_eq!(code, 0);
}

// Globals: init writes, main reads, the host observes through the
// variable's address.
#[test]
fn test_globals_and_init() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let g = pb.global("main", "counter", ty::INT);
    let void = store.signature(vec![], vec![], false);
    let init_fid = pb.declare_func("main", "init", void, &[]);
    let main_fid = pb.declare_func("main", "main", void, &[]);
    let c41 = pb.const_int(41);
    let c1 = pb.const_int(1);
    let c42 = pb.const_int(42);
    {
        let mut fb = pb.define_func(init_fid);
        fb.store_value(g, c41);
        fb.ret(vec![]);
        fb.finish();
    }
    pb.add_init(init_fid);
    {
        let mut fb = pb.define_func(main_fid);
        let ok_b = fb.new_block();
        let bad_b = fb.new_block();
        let cur = fb.unop(UnOp::Deref, g, false);
        let next = fb.binop(BinOp::Add, cur, c1);
        fb.store_value(g, next);
        let good = fb.binop(BinOp::Eql, next, c42);
        fb.br(good, ok_b, bad_b);
        fb.switch_to(ok_b);
        fb.ret(vec![]);
        fb.switch_to(bad_b);
        emit_panic(&mut fb, next);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let interp = ctx.new_interp(&prog).unwrap();
    interp.run_init().unwrap();
    let (code, err) = interp.run_main("main");
    assert!(err.is_none(), "unexpected error: {:?}", err.map(|e| e.to_string()));
    assert_eq!(code, 0);

    let addr = interp.get_var_addr("counter").expect("counter address");
    match addr {
        Value::Pointer(p) => assert_eq!(p.place.load(), Value::Int(42)),
        other => panic!("expected pointer, got {}", other.kind_name()),
    }
}

// A panic thrown inside init surfaces as an init error.
#[test]
fn test_init_error() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let void = store.signature(vec![], vec![], false);
    let init_fid = pb.declare_func("main", "init", void, &[]);
    let main_fid = pb.declare_func("main", "main", void, &[]);
    let msg = pb.const_str("bad init");
    {
        let mut fb = pb.define_func(init_fid);
        emit_panic(&mut fb, msg);
        fb.finish();
    }
    pb.add_init(init_fid);
    {
        let mut fb = pb.define_func(main_fid);
        fb.ret(vec![]);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert_eq!(code, 2);
    match err {
        Some(e @ Error::Init(_)) => {
            assert!(e.to_string().starts_with("init error:"), "message: {}", e)
        }
        other => panic!("expected init error, got {:?}", other.map(|e| e.to_string())),
    }
}

// A missing entrypoint maps to exit code 1.
#[test]
fn test_missing_entrypoint() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let pb = ProgramBuilder::new(store.clone(), "main");
    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert_eq!(code, 1);
    assert!(matches!(err, Some(Error::NoFunction(_))));
}

// Interface invoke: dynamic dispatch picks the method from the receiver's
// dynamic type.
#[test]
fn test_interface_invoke() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let t = store.named("main", "Doubler", ty::INT);
    let m_sig = store.signature(vec![t], vec![ty::INT], false);
    let m_fid = pb.declare_method(t, "Double", m_sig, &["d"]);

    let iface = store.interface(vec![sago_ssa::Method {
        name: "Double".to_string(),
        sig: store.signature(vec![], vec![ty::INT], false),
    }]);

    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);
    let c21 = pb.const_int(21);
    let c42 = pb.const_of(t, ConstValue::Int(42));
    {
        let mut fb = pb.define_func(m_fid);
        let d = fb.param(0);
        let out = fb.binop(BinOp::Add, d, d);
        fb.ret(vec![out]);
        fb.finish();
    }
    {
        let mut fb = pb.define_func(main_fid);
        let ok_b = fb.new_block();
        let bad_b = fb.new_block();
        let val = fb.change_type(t, c21);
        let boxed = fb.make_interface(iface, val);
        let call_sig = store.signature(vec![t], vec![ty::INT], false);
        let r = fb.call_method(boxed, "Double", vec![], call_sig);
        let good = fb.binop(BinOp::Eql, r, c42);
        fb.br(good, ok_b, bad_b);
        fb.switch_to(ok_b);
        fb.ret(vec![]);
        fb.switch_to(bad_b);
        emit_panic(&mut fb, r);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert!(err.is_none(), "unexpected error: {:?}", err.map(|e| e.to_string()));
    assert_eq!(code, 0);
}

// Slices share their backing store; append within capacity aliases, and
// slicing a pointer-to-array aliases the array.
#[test]
fn test_slice_semantics() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let arr_ty = store.array(ty::INT, 3);
    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);
    let c0 = pb.const_int(0);
    let c9 = pb.const_int(9);
    {
        let mut fb = pb.define_func(main_fid);
        let ok_b = fb.new_block();
        let bad_b = fb.new_block();

        // var a [3]int; s := a[:]; s[0] = 9; a[0] must observe 9.
        let ap = fb.alloc(arr_ty, false);
        let s = fb.slice_op(ap, None, None, None);
        let e0 = fb.index_addr(s, c0);
        fb.store_value(e0, c9);
        let arr = fb.unop(UnOp::Deref, ap, false);
        let a0 = fb.index(arr, c0);
        let good = fb.binop(BinOp::Eql, a0, c9);
        fb.br(good, ok_b, bad_b);
        fb.switch_to(ok_b);
        fb.ret(vec![]);
        fb.switch_to(bad_b);
        emit_panic(&mut fb, a0);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert!(err.is_none(), "unexpected error: {:?}", err.map(|e| e.to_string()));
    assert_eq!(code, 0);
}

// Out-of-range indexing is a runtime error with the index and length.
#[test]
fn test_index_out_of_range() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);
    let c2 = pb.const_int(2);
    let c5 = pb.const_int(5);
    {
        let mut fb = pb.define_func(main_fid);
        let s = fb.make_slice(store.slice(ty::INT), c2, c2);
        let e = fb.index_addr(s, c5);
        let loaded = fb.unop(UnOp::Deref, e, false);
        let _ = loaded;
        fb.ret(vec![]);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert_eq!(code, 2);
    match err {
        Some(Error::Runtime(e)) => {
            assert_eq!(e.to_string(), "runtime error: index out of range [5] with length 2")
        }
        other => panic!("expected runtime error, got {:?}", other.map(|e| e.to_string())),
    }
}

// Division by zero inside interpreted code surfaces as a runtime error.
#[test]
fn test_divide_by_zero_runtime() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let div_sig = store.signature(vec![ty::INT, ty::INT], vec![ty::INT], false);
    let div_fid = pb.declare_func("main", "div", div_sig, &["a", "b"]);
    let main_sig = store.signature(vec![], vec![], false);
    let main_fid = pb.declare_func("main", "main", main_sig, &[]);
    let c1 = pb.const_int(1);
    let c0 = pb.const_int(0);
    {
        let mut fb = pb.define_func(div_fid);
        let q = fb.binop(BinOp::Quo, fb.param(0), fb.param(1));
        fb.ret(vec![q]);
        fb.finish();
    }
    {
        let mut fb = pb.define_func(main_fid);
        let callee = fb.func_value(div_fid);
        fb.call(callee, vec![c1, c0]);
        fb.ret(vec![]);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let (code, err) = run(&ctx, &prog);
    assert_eq!(code, 2);
    match err {
        Some(Error::Runtime(e)) => {
            assert_eq!(e.to_string(), "runtime error: integer divide by zero")
        }
        other => panic!("expected runtime error, got {:?}", other.map(|e| e.to_string())),
    }
}

// run_func calls a named function with host values.
#[test]
fn test_run_func_with_args() {
    let ctx = Context::new(Mode::NONE);
    let store = ctx.type_store();
    let mut pb = ProgramBuilder::new(store.clone(), "main");

    let add_sig = store.signature(vec![ty::INT, ty::INT], vec![ty::INT], false);
    let add_fid = pb.declare_func("main", "Add", add_sig, &["a", "b"]);
    {
        let mut fb = pb.define_func(add_fid);
        let s = fb.binop(BinOp::Add, fb.param(0), fb.param(1));
        fb.ret(vec![s]);
        fb.finish();
    }

    let prog = Arc::new(pb.finish());
    let got = ctx
        .run_func(&prog, "Add", vec![Value::Int(19), Value::Int(23)])
        .unwrap();
    assert_eq!(got, Value::Int(42));
}
