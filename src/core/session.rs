// This module provides the arena-backed compilation session owned by one compilation unit.
// CompilationSession holds a bumpalo arena for interned names (kernel and symbol names are
// interned once and shared by the pipeline, the encoder and the container writer) and a
// SessionStats record updated through interior mutability as the unit moves through the
// pass pipeline, lowering and encoding. Statistics cover pass activity (runs and changes per
// pass), encoded instruction counts including how many were compacted, code size, the
// largest kernel and per-kernel failures. Sessions are never shared between threads; batch
// compilation gives every unit its own arena and session.

//! Arena-based compilation session management.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

/// Per-unit compilation session.
pub struct CompilationSession<'arena> {
    arena: &'arena Bump,

    stats: RefCell<SessionStats>,

    interned_strings: RefCell<HashMap<&'arena str, ()>>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Allocate a slice in the session arena.
    pub fn alloc_slice<T: Clone>(&self, slice: &[T]) -> &'arena [T] {
        self.arena.alloc_slice_clone(slice)
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some((&interned, _)) = strings.get_key_value(s) {
            return interned;
        }
        let interned: &'arena str = self.arena.alloc_str(s);
        strings.insert(interned, ());
        interned
    }

    pub fn record_pass_run(&self, name: &'static str, changed: bool) {
        let mut stats = self.stats.borrow_mut();
        stats.passes_run += 1;
        if changed {
            *stats.pass_changes.entry(name).or_insert(0) += 1;
        }
    }

    pub fn record_kernel_encoded(&self, name: &str, code_size: usize, instructions: usize, compacted: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.kernels_compiled += 1;
        stats.total_code_size += code_size;
        stats.instructions_encoded += instructions;
        stats.compacted_instructions += compacted;

        if stats.largest_kernel_size < code_size {
            stats.largest_kernel_size = code_size;
            stats.largest_kernel_name = name.to_string();
        }
    }

    pub fn record_kernel_failed(&self, name: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.kernels_failed += 1;
        log::debug!("kernel '{}' failed", name);
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub passes_run: usize,

    /// Number of runs that reported a change, per pass name.
    pub pass_changes: HashMap<&'static str, usize>,

    pub kernels_compiled: usize,

    pub kernels_failed: usize,

    pub instructions_encoded: usize,

    /// Instructions emitted in the 64-bit compact form.
    pub compacted_instructions: usize,

    /// Total code size generated (bytes).
    pub total_code_size: usize,

    pub largest_kernel_size: usize,

    pub largest_kernel_name: String,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Passes run: {}", self.passes_run)?;
        writeln!(f, "  Kernels compiled: {}", self.kernels_compiled)?;
        writeln!(f, "  Kernels failed: {}", self.kernels_failed)?;
        writeln!(
            f,
            "  Instructions encoded: {} ({} compacted)",
            self.instructions_encoded, self.compacted_instructions
        )?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;

        if !self.largest_kernel_name.is_empty() {
            writeln!(
                f,
                "  Largest kernel: {} ({} bytes)",
                self.largest_kernel_name, self.largest_kernel_size
            )?;
        }

        if !self.pass_changes.is_empty() {
            writeln!(f, "  Passes that changed the module:")?;
            let mut sorted: Vec<_> = self.pass_changes.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            for (pass, count) in sorted {
                writeln!(f, "    {}: {}", pass, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let s1 = session.intern_str("kernel_a");
        let s2 = session.intern_str("kernel_a");
        let s3 = session.intern_str("kernel_b");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_pass_run("fold-predefined-constants", true);
        session.record_pass_run("fold-predefined-constants", false);
        session.record_pass_run("disable-inlining", true);
        session.record_kernel_encoded("small", 64, 5, 2);
        session.record_kernel_encoded("big", 256, 16, 0);
        session.record_kernel_failed("broken");

        let stats = session.stats();
        assert_eq!(stats.passes_run, 3);
        assert_eq!(stats.pass_changes["fold-predefined-constants"], 1);
        assert_eq!(stats.kernels_compiled, 2);
        assert_eq!(stats.kernels_failed, 1);
        assert_eq!(stats.instructions_encoded, 21);
        assert_eq!(stats.compacted_instructions, 2);
        assert_eq!(stats.largest_kernel_name, "big");

        let text = stats.to_string();
        assert!(text.contains("Largest kernel: big (256 bytes)"));
        assert!(text.contains("disable-inlining: 1"));
    }
}
