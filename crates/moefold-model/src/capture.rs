//! Scoped activation taps.
//!
//! A tap is registered against a layer and collects a copy of that layer's
//! input rows on every forward. The registration is owned by a
//! [`CaptureGuard`]; dropping the guard removes the tap, so a capture can
//! never outlive the scope that asked for it.

use std::cell::RefCell;
use std::rc::Rc;

use moefold_core::Matrix;

#[derive(Default)]
pub(crate) struct TapTable {
    next_id: u64,
    entries: Vec<TapEntry>,
}

struct TapEntry {
    id: u64,
    layer: usize,
    buf: Rc<RefCell<Vec<Matrix>>>,
}

impl TapTable {
    pub(crate) fn register(&mut self, layer: usize) -> (u64, Rc<RefCell<Vec<Matrix>>>) {
        let id = self.next_id;
        self.next_id += 1;
        let buf = Rc::new(RefCell::new(Vec::new()));
        self.entries.push(TapEntry {
            id,
            layer,
            buf: Rc::clone(&buf),
        });
        (id, buf)
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.entries.retain(|e| e.id != id);
    }

    /// Record `x` for every tap listening on `layer`.
    pub(crate) fn record(&self, layer: usize, x: &Matrix) {
        for entry in &self.entries {
            if entry.layer == layer {
                entry.buf.borrow_mut().push(x.clone());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// RAII handle for one registered layer-input tap.
pub struct CaptureGuard {
    id: u64,
    layer: usize,
    buf: Rc<RefCell<Vec<Matrix>>>,
    table: Rc<RefCell<TapTable>>,
}

impl CaptureGuard {
    pub(crate) fn new(
        id: u64,
        layer: usize,
        buf: Rc<RefCell<Vec<Matrix>>>,
        table: Rc<RefCell<TapTable>>,
    ) -> Self {
        Self {
            id,
            layer,
            buf,
            table,
        }
    }

    pub fn layer(&self) -> usize {
        self.layer
    }

    /// Number of forwards captured so far.
    pub fn len(&self) -> usize {
        self.buf.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.borrow().is_empty()
    }

    /// Drain the captured inputs, leaving the tap registered.
    pub fn take(&self) -> Vec<Matrix> {
        std::mem::take(&mut *self.buf.borrow_mut())
    }

    /// Drain and vertically concatenate all captured inputs.
    pub fn take_concat(&self) -> moefold_core::Result<Matrix> {
        let parts = self.take();
        let refs: Vec<&Matrix> = parts.iter().collect();
        Matrix::vstack(&refs)
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.table.borrow_mut().remove(self.id);
    }
}
