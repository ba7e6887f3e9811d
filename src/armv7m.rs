//! Augmented ARMv7-M operations.
//!
//! # Interrupt management
//!
//! The `enable_irq`, `disable_irq`, and `clear_pending_irq` functions provide
//! enhanced atomic interrupt status management: each guarantees that the
//! requested state change has taken effect by the time it returns, so the
//! caller can't race the interrupt it just masked. The methods are derived
//! from the ARM document *Cortex-M Programming Guide to Memory Barrier
//! Instructions*.

use cortex_m::peripheral::NVIC;

use crate::device::Interrupt;

/// Enables an interrupt with enhanced guarantees: the interrupt is enabled by
/// the time the function returns, so a pended IRQ (priority permitting) will
/// have had the chance to run.
///
/// If the interrupt was already enabled, this is a no-op.
pub fn enable_irq(i: Interrupt) {
    // Safety: unmasking is only unsafe in the presence of priority-based
    // critical sections that don't expect this interrupt; the firmware uses
    // PRIMASK-based sections only.
    unsafe { NVIC::unmask(i) };
    cortex_m::asm::dmb();
    cortex_m::asm::isb();
}

/// Disables an interrupt with enhanced guarantees: starting at the first
/// instruction after the call, execution cannot be preempted by `i`.
///
/// If the interrupt was already disabled, this is a no-op.
pub fn disable_irq(i: Interrupt) {
    NVIC::mask(i);
    cortex_m::asm::dmb();
    cortex_m::asm::isb();
}

/// Ensures that an interrupt is not pending. If hardware keeps generating
/// IRQs it may immediately pend again.
pub fn clear_pending_irq(i: Interrupt) {
    NVIC::unpend(i);
    // Arguably overkill, but *shrug*
    cortex_m::asm::dmb();
    cortex_m::asm::isb();
}

/// Sets the NVIC priority of `i`. `pri` runs 0 (highest) to 15 (lowest); the
/// STM32 implements only the upper four bits of the priority byte.
pub fn set_irq_priority(nvic: &mut NVIC, i: Interrupt, pri: u8) {
    // Safety: changing priorities can break priority-based sections, which
    // this firmware doesn't use; callers do this before enabling `i`.
    unsafe { nvic.set_priority(i, pri << 4) };
}

/// Runs `f` with interrupts masked (PRIMASK). The architecture-independent
/// builds used by the test suite have no interrupts to mask; there `f`
/// just runs.
pub fn masked<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(target_os = "none")]
    {
        cortex_m::interrupt::free(|_| f())
    }
    #[cfg(not(target_os = "none"))]
    {
        f()
    }
}
