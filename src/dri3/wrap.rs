// SPDX-License-Identifier: GPL-3.0-only

//! Wrapping of screen operation slots.
//!
//! A [`Wrapped`] value is the only record of the handler that was in a slot
//! before ours. Delegation goes through [`Wrapped::previous`], and
//! [`Wrapped::restore`] consumes the wrapper, so a slot is unwrapped at most
//! once.
//!
//! Wrappers have to be restored in the reverse order they were installed.
//! Restoring one while another still sits on top of it puts the previous
//! handler back anyway, which unlinks the outer wrapper's handler from the
//! chain; `restore` reports that by returning `false`.

use std::{
    marker::PhantomData,
    rc::{Rc, Weak},
};

use tracing::{trace, warn};

use crate::screen::{CloseScreenProc, DestroyPixmapProc, ScreenProcs};

pub trait ProcSlot {
    type Proc: ?Sized;
    const NAME: &'static str;

    fn slot(procs: &mut ScreenProcs) -> &mut Rc<Self::Proc>;
}

pub struct DestroyPixmapSlot;

impl ProcSlot for DestroyPixmapSlot {
    type Proc = DestroyPixmapProc;
    const NAME: &'static str = "DestroyPixmap";

    fn slot(procs: &mut ScreenProcs) -> &mut Rc<DestroyPixmapProc> {
        &mut procs.destroy_pixmap
    }
}

pub struct CloseScreenSlot;

impl ProcSlot for CloseScreenSlot {
    type Proc = CloseScreenProc;
    const NAME: &'static str = "CloseScreen";

    fn slot(procs: &mut ScreenProcs) -> &mut Rc<CloseScreenProc> {
        &mut procs.close_screen
    }
}

#[must_use = "a wrapped slot has to be restored"]
pub struct Wrapped<S: ProcSlot> {
    previous: Rc<S::Proc>,
    installed: Weak<S::Proc>,
    _slot: PhantomData<S>,
}

impl<S: ProcSlot> std::fmt::Debug for Wrapped<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Wrapped").field("slot", &S::NAME).finish()
    }
}

impl<S: ProcSlot> Wrapped<S> {
    /// Installs `proc` into the slot and keeps the handler it replaces.
    pub fn install(procs: &mut ScreenProcs, proc: Rc<S::Proc>) -> Wrapped<S> {
        let installed = Rc::downgrade(&proc);
        let previous = std::mem::replace(S::slot(procs), proc);
        trace!(slot = S::NAME, "wrapped screen proc");
        Wrapped {
            previous,
            installed,
            _slot: PhantomData,
        }
    }

    /// The handler to delegate to.
    pub fn previous(&self) -> &Rc<S::Proc> {
        &self.previous
    }

    /// Puts the previous handler back.
    ///
    /// Returns `false` if the slot no longer held our handler, in which case
    /// whatever was installed on top of it is gone from the chain.
    pub fn restore(self, procs: &mut ScreenProcs) -> bool {
        let slot = S::slot(procs);
        let in_order = Weak::ptr_eq(&Rc::downgrade(slot), &self.installed);
        if !in_order {
            warn!(slot = S::NAME, "restoring a screen proc out of order");
        }
        *slot = self.previous;
        trace!(slot = S::NAME, "unwrapped screen proc");
        in_order
    }
}
