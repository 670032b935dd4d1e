//! Fiber-local storage.
//!
//! Keys are process-global (per runtime thread) with a small compile-time
//! limit, and the destructor table is shared across fibers: whichever
//! fiber ends, the destructor registered for the key runs on that fiber's
//! value.

use core::any::Any;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::sched::with_vp;

/// Upper bound on live keys.
pub const KEYS_MAX: usize = 16;

/// Runs when a fiber terminates with a value set for the key, and when a
/// set value is replaced.
pub type Destructor = fn(Rc<dyn Any>);

/// Storage key, shared by all fibers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Key(usize);

/// Allocates a key. Keys are never reclaimed; fails `Busy` once
/// `KEYS_MAX` keys exist.
pub fn key_create(destructor: Option<Destructor>) -> Result<Key> {
    with_vp(|vp| {
        let core = &mut vp.core;
        if core.fls_key_count >= KEYS_MAX {
            return Err(Error::Busy);
        }
        let key = core.fls_key_count;
        core.fls_key_count += 1;
        core.fls_destructors[key] = destructor;
        Ok(Key(key))
    })
}

pub fn key_limit() -> usize {
    KEYS_MAX
}

/// Sets the calling fiber's value for `key`, running the key's destructor
/// on any previous value.
pub fn set(key: Key, value: Option<Rc<dyn Any>>) -> Result<()> {
    let old = with_vp(|vp| {
        let core = &mut vp.core;
        if key.0 >= core.fls_key_count {
            return Err(Error::InvalidArg);
        }
        let dtor = core.fls_destructors[key.0];
        let me = core.cur;
        let slot = &mut core.fibers.get_mut(me).expect("current fiber").fls[key.0];
        let old = slot.take();
        *slot = value;
        Ok(old.and_then(|v| dtor.map(|d| (d, v))))
    })?;
    if let Some((dtor, value)) = old {
        dtor(value);
    }
    Ok(())
}

/// The calling fiber's value for `key`, if any.
pub fn get(key: Key) -> Option<Rc<dyn Any>> {
    with_vp(|vp| {
        let core = &mut vp.core;
        if key.0 >= core.fls_key_count {
            return None;
        }
        let me = core.cur;
        core.fibers.get(me).expect("current fiber").fls[key.0].clone()
    })
}
