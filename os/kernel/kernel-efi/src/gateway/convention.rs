//! Physical-mode calling convention.
//!
//! Before the address-map call, firmware code runs with its own identity
//! address space and control-register state. Every physical-mode call is
//! bracketed by a [`ConventionGuard`] that enters that state and restores
//! the kernel's on every exit path.

/// Boot stage a physical-mode call is made in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CallStage {
    /// Only the system table has been discovered.
    Early,
    /// The full entry-point table and memory map are available.
    Full,
    /// The platform stays in physical mode for good.
    Permanent,
}

/// Register save/restore and address-space switch around firmware calls.
///
/// Implementations are shared by every caller of the runtime services and
/// must serialize concurrent `enter`/`exit` pairs themselves.
pub trait PhysCallGate {
    /// Switches into the convention firmware expects.
    fn enter(&self, stage: CallStage);

    /// Restores the kernel's convention. Always paired with one `enter`.
    fn exit(&self, stage: CallStage);

    /// One-time setup before physical mode is made permanent, such as building
    /// the identity page tables firmware will run on.
    fn prepare_physical_mode(&self) {}
}

/// Scoped physical-mode convention: entered on creation, exited on drop.
#[must_use]
pub struct ConventionGuard<'g, G: PhysCallGate + ?Sized> {
    gate: &'g G,
    stage: CallStage,
}

impl<'g, G: PhysCallGate + ?Sized> ConventionGuard<'g, G> {
    pub fn enter(gate: &'g G, stage: CallStage) -> Self {
        gate.enter(stage);
        Self { gate, stage }
    }
}

impl<G: PhysCallGate + ?Sized> Drop for ConventionGuard<'_, G> {
    fn drop(&mut self) {
        self.gate.exit(self.stage);
    }
}
