//! Per-compilation knobs.

/// Optimization and emission settings for one method compilation.
///
/// Everything defaults to on except debug checks; the switches exist so a
/// driver can bisect miscompiles and so tests can pin down a single
/// transformation.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Fold constant-operand arithmetic and comparisons into constant nodes.
    pub fold_constants: bool,
    /// Emit a repeated identical constant push as `dup`.
    pub fold_dup: bool,
    /// Collect chains of string `add`s into one n-ary concatenation.
    pub fold_string_concat: bool,
    /// Emit extra IL assertions around stack stashes and handler dispatch.
    pub emit_debug_checks: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            fold_constants: true,
            fold_dup: true,
            fold_string_concat: true,
            emit_debug_checks: false,
        }
    }
}
