//! Language builtins, dispatched by name from call steps.
//!
//! The by-stack path reads arguments from pre-assigned registers; the
//! by-value paths serve `go`/`defer` of a builtin. `recover` is the one
//! builtin that needs its caller's frame; a deferred `recover()` is by
//! definition one level too shallow and yields nil.

use std::sync::Arc;

use sago_ssa::types::builtin as ty;

use crate::compile::Register;
use crate::error::Panic;
use crate::interp::{do_recover, Frame, Interp};
use crate::value::{
    format_interface, format_value, zero_value, MapKey, normalize_blank_key, Place, SliceVal,
    Value,
};

pub(crate) fn call_builtin_by_stack(
    interp: &Arc<Interp>,
    caller: &mut Frame,
    name: &str,
    iface_args: &[bool],
    ir: Register,
    ia: &[Register],
) -> Result<(), Panic> {
    match name {
        "append" if ia.len() == 1 => {
            caller.copy_reg(interp, ir, ia[0]);
            return Ok(());
        }
        "recover" => {
            let v = do_recover(interp, caller);
            caller.set_reg(ir, v);
            return Ok(());
        }
        _ => {}
    }
    let args: Vec<Value> = ia.iter().map(|r| caller.reg(interp, *r)).collect();
    let out = builtin_core(interp, name, args, iface_args)?;
    caller.set_reg(ir, out);
    Ok(())
}

/// `go builtin(...)`.
pub(crate) fn call_builtin_by_value(
    interp: &Arc<Interp>,
    name: &str,
    args: Vec<Value>,
    iface_args: &[bool],
) -> Result<Value, Panic> {
    if name == "recover" {
        return Ok(Value::Nil);
    }
    builtin_core(interp, name, args, iface_args)
}

/// `defer builtin(...)`. A deferred `recover()` is too shallow to observe
/// the panic and yields nil without consuming it.
pub(crate) fn call_builtin_deferred(
    interp: &Arc<Interp>,
    name: &str,
    args: Vec<Value>,
    iface_args: &[bool],
) -> Result<Value, Panic> {
    if name == "recover" {
        return Ok(Value::Nil);
    }
    builtin_core(interp, name, args, iface_args)
}

fn builtin_core(
    interp: &Arc<Interp>,
    name: &str,
    mut args: Vec<Value>,
    iface_args: &[bool],
) -> Result<Value, Panic> {
    match name {
        "append" => builtin_append(interp, args),

        "copy" => {
            let n = builtin_copy(&args)?;
            Ok(Value::Int(n as i64))
        }

        "close" => match args[0].unnamed() {
            Value::Chan(ch) => {
                ch.core.close()?;
                Ok(Value::Nil)
            }
            Value::Nil => Err(Panic::runtime("close of nil channel")),
            other => Err(Panic::runtime(format!("close of {}", other.kind_name()))),
        },

        "delete" => {
            let key = args.pop().unwrap_or(Value::Nil);
            match args[0].unnamed() {
                Value::Map(mv) => {
                    let mut key = key;
                    if interp.record.map_key_has_blank(&interp.store, mv.typ) {
                        normalize_blank_key(&interp.store, &mut key);
                    }
                    mv.inner.lock().shift_remove(&MapKey(key));
                    Ok(Value::Nil)
                }
                Value::Nil => Ok(Value::Nil),
                other => Err(Panic::runtime(format!("delete from {}", other.kind_name()))),
            }
        }

        "print" | "println" => {
            let ln = name == "println";
            let mut buf = String::new();
            for (i, arg) in args.iter().enumerate() {
                if i > 0 && ln {
                    buf.push(' ');
                }
                if iface_args.get(i).copied().unwrap_or(false) {
                    buf.push_str(&format_interface(arg));
                } else {
                    buf.push_str(&format_value(arg));
                }
            }
            if ln {
                buf.push('\n');
            }
            interp.ctx.write_output(buf.as_bytes());
            Ok(Value::Nil)
        }

        "len" => {
            let n = match args[0].unnamed() {
                Value::Str(s) => s.len(),
                Value::Slice(sv) => sv.len,
                Value::Map(mv) => mv.inner.lock().len(),
                Value::Chan(ch) => ch.core.len(),
                Value::Array(a) => a.elems.len(),
                Value::Nil => 0,
                other => {
                    return Err(Panic::runtime(format!("len of {}", other.kind_name())))
                }
            };
            Ok(Value::Int(n as i64))
        }

        "cap" => {
            let n = match args[0].unnamed() {
                Value::Slice(sv) => sv.cap,
                Value::Chan(ch) => ch.core.cap(),
                Value::Array(a) => a.elems.len(),
                Value::Nil => 0,
                other => {
                    return Err(Panic::runtime(format!("cap of {}", other.kind_name())))
                }
            };
            Ok(Value::Int(n as i64))
        }

        "real" => match args[0].unnamed() {
            Value::Complex64(c) => Ok(Value::Float32(c.re)),
            Value::Complex128(c) => Ok(Value::Float64(c.re)),
            other => Err(Panic::runtime(format!("real: illegal operand: {}", other.kind_name()))),
        },

        "imag" => match args[0].unnamed() {
            Value::Complex64(c) => Ok(Value::Float32(c.im)),
            Value::Complex128(c) => Ok(Value::Float64(c.im)),
            other => Err(Panic::runtime(format!("imag: illegal operand: {}", other.kind_name()))),
        },

        "complex" => match (args[0].unnamed(), args[1].unnamed()) {
            (Value::Float32(r), Value::Float32(i)) => {
                Ok(Value::Complex64(num_complex::Complex32::new(*r, *i)))
            }
            (Value::Float64(r), Value::Float64(i)) => {
                Ok(Value::Complex128(num_complex::Complex64::new(*r, *i)))
            }
            (r, _) => Err(Panic::runtime(format!(
                "complex: illegal operand: {}",
                r.kind_name()
            ))),
        },

        "panic" => {
            // The Panic instruction handles most cases; this is only for
            // `go panic(...)` or `defer panic(...)`.
            Err(Panic::Target(args.swap_remove(0)))
        }

        "ssa:wrapnilchk" => {
            let recv = args[0].clone();
            if recv.is_nil() {
                let recv_type = match args[1].unnamed() {
                    Value::Str(s) => s.to_string(),
                    other => format_value(other),
                };
                let method = match args[2].unnamed() {
                    Value::Str(s) => s.to_string(),
                    other => format_value(other),
                };
                let info = recv_type.strip_prefix("main.").unwrap_or(&recv_type);
                return Err(Panic::Plain(format!(
                    "value method {}.{} called using nil *{} pointer",
                    recv_type, method, info
                )));
            }
            Ok(recv)
        }

        "Add" => {
            // unsafe.Add: advance an element pointer.
            let n = args[1].as_int()?;
            match args[0].unnamed() {
                Value::Pointer(p) => {
                    let mut p = p.clone();
                    p.place = offset_place(&p.place, n)?;
                    Ok(Value::Pointer(p))
                }
                Value::Nil if n == 0 => Ok(Value::Nil),
                _ => Err(Panic::runtime("unsafe.Add: invalid pointer")),
            }
        }

        "Slice" => {
            // unsafe.Slice(ptr, n): a slice view of n elements at ptr.
            let n = args[1].as_int()?;
            match args[0].unnamed() {
                Value::Nil => {
                    if n == 0 {
                        Ok(Value::Nil)
                    } else {
                        Err(Panic::runtime("unsafe.Slice: ptr is nil and len is not zero"))
                    }
                }
                Value::Pointer(p) => {
                    if n < 0 {
                        return Err(Panic::runtime("unsafe.Slice: len out of range"));
                    }
                    let elem = interp.store.elem(p.typ).unwrap_or(ty::INVALID);
                    let slice_ty = interp.store.slice(elem);
                    match &p.place {
                        Place::SliceElem { buf, index } => {
                            let avail = buf.lock().len().saturating_sub(*index);
                            if n as usize > avail {
                                return Err(Panic::runtime("unsafe.Slice: len out of range"));
                            }
                            Ok(Value::Slice(SliceVal {
                                typ: slice_ty,
                                backing: crate::value::SliceBacking::Buf(buf.clone()),
                                off: *index,
                                len: n as usize,
                                cap: avail,
                            }))
                        }
                        place => {
                            // A lone cell: a one-element view.
                            if n as usize > 1 {
                                return Err(Panic::runtime("unsafe.Slice: len out of range"));
                            }
                            let mut sv =
                                SliceVal::from_array_place(slice_ty, place.clone(), 1);
                            sv.len = n as usize;
                            Ok(Value::Slice(sv))
                        }
                    }
                }
                other => Err(Panic::runtime(format!(
                    "unsafe.Slice of {}",
                    other.kind_name()
                ))),
            }
        }

        _ => {
            if let Some(f) = interp.ctx.find_custom_builtin(name) {
                return f(interp, &args);
            }
            Err(Panic::Plain(format!("unknown built-in: {}", name)))
        }
    }
}

fn builtin_append(interp: &Arc<Interp>, mut args: Vec<Value>) -> Result<Value, Panic> {
    if args.len() == 1 {
        return Ok(args.swap_remove(0));
    }
    let extra = args.pop().unwrap();
    let base = args.swap_remove(0);

    // append([]byte, string...) widens the string first.
    let (extra_vals, extra_typ) = match extra.unnamed() {
        Value::Str(s) => {
            let vals: Vec<Value> = s.as_bytes().iter().map(|b| Value::Uint8(*b)).collect();
            (vals, interp.store.slice(ty::UINT8))
        }
        Value::Slice(sv) => (sv.read_all(), sv.typ),
        Value::Nil => (Vec::new(), ty::INVALID),
        other => {
            return Err(Panic::runtime(format!("append of {}", other.kind_name())))
        }
    };

    let sv = match base.unnamed() {
        Value::Slice(sv) => sv.clone(),
        Value::Nil => {
            if extra_vals.is_empty() {
                return Ok(base);
            }
            let mut out = SliceVal::from_vec(extra_typ, extra_vals);
            out.typ = extra_typ;
            return Ok(Value::Slice(out));
        }
        other => {
            return Err(Panic::runtime(format!("append to {}", other.kind_name())))
        }
    };

    let i0 = sv.len;
    let i1 = extra_vals.len();
    let total = match i0.checked_add(i1) {
        Some(t) => t,
        None => return Err(Panic::runtime("growslice: cap out of range")),
    };
    if total > (crate::compile::MAX_MEM_LEN as usize) {
        return Err(Panic::runtime("growslice: cap out of range"));
    }

    if total <= sv.cap {
        for (k, v) in extra_vals.into_iter().enumerate() {
            sv.set(i0 + k, v);
        }
        let mut out = sv.clone();
        out.len = total;
        Ok(Value::Slice(out))
    } else {
        let new_cap = total.max(sv.cap * 2).max(4);
        let mut elems = sv.read_all();
        elems.extend(extra_vals);
        let elem_ty = interp.store.elem(sv.typ).unwrap_or(ty::INVALID);
        let zero = zero_value(&interp.store, elem_ty);
        elems.resize(new_cap, zero);
        let mut out = SliceVal::from_vec(sv.typ, elems);
        out.len = total;
        out.cap = new_cap;
        Ok(Value::Slice(out))
    }
}

fn builtin_copy(args: &[Value]) -> Result<usize, Panic> {
    let src_vals: Vec<Value> = match args[1].unnamed() {
        Value::Str(s) => s.as_bytes().iter().map(|b| Value::Uint8(*b)).collect(),
        Value::Slice(sv) => sv.read_all(),
        Value::Nil => Vec::new(),
        other => return Err(Panic::runtime(format!("copy from {}", other.kind_name()))),
    };
    match args[0].unnamed() {
        Value::Slice(dst) => {
            let n = dst.len.min(src_vals.len());
            for (i, v) in src_vals.into_iter().take(n).enumerate() {
                dst.set(i, v);
            }
            Ok(n)
        }
        Value::Nil => Ok(0),
        other => Err(Panic::runtime(format!("copy to {}", other.kind_name()))),
    }
}

/// Shift an element pointer by `n` elements.
fn offset_place(place: &Place, n: i64) -> Result<Place, Panic> {
    let adjust = |index: usize| -> Result<usize, Panic> {
        let out = index as i64 + n;
        if out < 0 {
            return Err(Panic::runtime("unsafe.Add: pointer out of range"));
        }
        Ok(out as usize)
    };
    match place {
        Place::SliceElem { buf, index } => {
            Ok(Place::SliceElem { buf: buf.clone(), index: adjust(*index)? })
        }
        Place::Index { base, index } => {
            Ok(Place::Index { base: base.clone(), index: adjust(*index)? })
        }
        other if n == 0 => Ok(other.clone()),
        _ => Err(Panic::runtime("unsafe.Add: pointer out of range")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_place() {
        let buf: crate::value::SliceBuf =
            Arc::new(parking_lot::Mutex::new(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
        let p = Place::SliceElem { buf: buf.clone(), index: 0 };
        let p2 = offset_place(&p, 2).unwrap();
        assert_eq!(p2.load(), Value::Int(3));
        assert!(offset_place(&p, -1).is_err());
    }
}
