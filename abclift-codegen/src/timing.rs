//! Pass timing.
//!
//! Each pass body opens with `let _tt = timing::decode();` and the guard
//! accumulates wall-clock time per pass in a thread-local table. The numbers
//! are diagnostic only; nothing in the compiler reads them back.

use std::cell::RefCell;
use std::fmt::Write;
use std::time::{Duration, Instant};

const NUM_PASSES: usize = 7;

const PASS_NAMES: [&str; NUM_PASSES] = [
    "decode",
    "flowgraph",
    "exceptions",
    "domtree",
    "dataflow",
    "semantics",
    "codegen",
];

thread_local! {
    static TOTALS: RefCell<[Duration; NUM_PASSES]> = RefCell::new(Default::default());
}

/// Guard accumulating elapsed time for one pass on drop.
pub struct PassTimer {
    pass: usize,
    start: Instant,
}

impl Drop for PassTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        TOTALS.with(|t| t.borrow_mut()[self.pass] += elapsed);
    }
}

fn start(pass: usize) -> PassTimer {
    PassTimer {
        pass,
        start: Instant::now(),
    }
}

/// Start timing the decoder.
pub fn decode() -> PassTimer {
    start(0)
}

/// Start timing the flow assembler.
pub fn flowgraph() -> PassTimer {
    start(1)
}

/// Start timing exception-region construction.
pub fn exceptions() -> PassTimer {
    start(2)
}

/// Start timing postorder and dominator computation.
pub fn domtree() -> PassTimer {
    start(3)
}

/// Start timing the data-flow builder.
pub fn dataflow() -> PassTimer {
    start(4)
}

/// Start timing the semantic analyzer.
pub fn semantics() -> PassTimer {
    start(5)
}

/// Start timing IL generation.
pub fn codegen() -> PassTimer {
    start(6)
}

/// Render and reset this thread's accumulated pass times.
pub fn take_summary() -> String {
    TOTALS.with(|t| {
        let mut totals = t.borrow_mut();
        let mut out = String::new();
        for (name, total) in PASS_NAMES.iter().zip(totals.iter()) {
            let _ = writeln!(out, "{:>12}  {:?}", name, total);
        }
        *totals = Default::default();
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_every_pass() {
        {
            let _tt = decode();
        }
        let summary = take_summary();
        for name in &PASS_NAMES {
            assert!(summary.contains(name), "{} missing", name);
        }
        // A second take starts from zero.
        assert!(!take_summary().is_empty());
    }
}
