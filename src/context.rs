//! Execution-context capture and restore.
//!
//! An [`ExecutionContext`] is the callee-saved register file of a suspended
//! flow of control. [`switch`] stores the running flow into one context and
//! resumes another; the call only returns once something switches back to the
//! context it saved into. Everything above this module (fibers, the
//! dispatcher) is built from that single operation.

use std::arch::naked_asm;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("jmpsched only supports x86_64 and aarch64");

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::*;
    use std::arch::asm;

    /// Saved register state of a suspended flow of control.
    ///
    /// Only the registers the System V ABI requires a callee to preserve are
    /// kept; everything else is already spilled by the compiler around the
    /// `switch` call.
    #[repr(C)]
    #[derive(Debug, Clone, Default)]
    pub struct ExecutionContext {
        rsp: u64,
        rbp: u64,
        rbx: u64,
        r12: u64,
        r13: u64,
        r14: u64,
        r15: u64,
    }

    impl ExecutionContext {
        /// Build a context that starts running `entry` on a fresh stack.
        ///
        /// `stack_top` must be the 16-byte aligned upper end of the stack.
        /// `arg` is handed to `entry` through r15 and read with [`entry_arg`].
        ///
        /// # Safety
        /// `stack_top - 16 .. stack_top` must be writable memory owned by the
        /// caller for as long as the context may be resumed.
        pub unsafe fn for_entry(stack_top: usize, entry: usize, arg: u64) -> Self {
            // `switch` ends in `ret`, so the entry address is planted where the
            // return address would be. After the pop rsp is 16n+8, which is
            // what a function expects right after `call`.
            let initial_rsp = stack_top - 16;
            unsafe {
                std::ptr::write(initial_rsp as *mut u64, entry as u64);
            }

            ExecutionContext {
                rsp: initial_rsp as u64,
                r15: arg,
                ..Default::default()
            }
        }

        pub fn stack_pointer(&self) -> usize {
            self.rsp as usize
        }
    }

    /// Read the argument planted by [`ExecutionContext::for_entry`].
    ///
    /// Only meaningful as the first thing an entry function does, before any
    /// call can clobber r15.
    #[inline(always)]
    pub fn entry_arg() -> u64 {
        let arg: u64;
        unsafe {
            asm!(
                "mov {}, r15",
                out(reg) arg,
                options(nomem, nostack, preserves_flags)
            );
        }
        arg
    }

    /// Save the running flow into `save` and resume `restore`.
    ///
    /// # Safety
    /// Both pointers must be valid, and `restore` must hold either a context
    /// built by `for_entry` or one previously filled by `switch` whose stack
    /// is still alive.
    #[unsafe(naked)]
    pub unsafe extern "C" fn switch(_save: *mut ExecutionContext, _restore: *const ExecutionContext) {
        naked_asm!(
            // save (rdi)
            "mov [rdi + 0x00], rsp",
            "mov [rdi + 0x08], rbp",
            "mov [rdi + 0x10], rbx",
            "mov [rdi + 0x18], r12",
            "mov [rdi + 0x20], r13",
            "mov [rdi + 0x28], r14",
            "mov [rdi + 0x30], r15",
            // restore (rsi)
            "mov rsp, [rsi + 0x00]",
            "mov rbp, [rsi + 0x08]",
            "mov rbx, [rsi + 0x10]",
            "mov r12, [rsi + 0x18]",
            "mov r13, [rsi + 0x20]",
            "mov r14, [rsi + 0x28]",
            "mov r15, [rsi + 0x30]",
            // Fresh context: pops the entry address. Saved context: returns
            // from the `switch` call that filled it.
            "ret",
        );
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::*;
    use std::arch::asm;

    /// Saved register state of a suspended flow of control.
    ///
    /// AAPCS64 callee-saved set: x19-x28, the frame pointer, the link
    /// register and the low halves of v8-v15.
    #[repr(C)]
    #[derive(Debug, Clone, Default)]
    pub struct ExecutionContext {
        sp: u64,
        lr: u64,
        fp: u64,
        x19: u64,
        x20: u64,
        x21: u64,
        x22: u64,
        x23: u64,
        x24: u64,
        x25: u64,
        x26: u64,
        x27: u64,
        x28: u64,
        d8: u64,
        d9: u64,
        d10: u64,
        d11: u64,
        d12: u64,
        d13: u64,
        d14: u64,
        d15: u64,
    }

    impl ExecutionContext {
        /// Build a context that starts running `entry` on a fresh stack.
        ///
        /// `stack_top` must be the 16-byte aligned upper end of the stack.
        /// `arg` is handed to `entry` through x19 and read with [`entry_arg`].
        ///
        /// # Safety
        /// The stack below `stack_top` must be owned by the caller for as long
        /// as the context may be resumed.
        pub unsafe fn for_entry(stack_top: usize, entry: usize, arg: u64) -> Self {
            // `ret` branches to lr, nothing needs to be planted on the stack.
            ExecutionContext {
                sp: stack_top as u64,
                lr: entry as u64,
                x19: arg,
                ..Default::default()
            }
        }

        pub fn stack_pointer(&self) -> usize {
            self.sp as usize
        }
    }

    /// Read the argument planted by [`ExecutionContext::for_entry`].
    ///
    /// Only meaningful as the first thing an entry function does.
    #[inline(always)]
    pub fn entry_arg() -> u64 {
        let arg: u64;
        unsafe {
            asm!(
                "mov {}, x19",
                out(reg) arg,
                options(nomem, nostack, preserves_flags)
            );
        }
        arg
    }

    /// Save the running flow into `save` and resume `restore`.
    ///
    /// # Safety
    /// Both pointers must be valid, and `restore` must hold either a context
    /// built by `for_entry` or one previously filled by `switch` whose stack
    /// is still alive.
    #[unsafe(naked)]
    pub unsafe extern "C" fn switch(_save: *mut ExecutionContext, _restore: *const ExecutionContext) {
        // x0 = save, x1 = restore
        naked_asm!(
            "mov x9, sp",
            "str x9,  [x0, #0x00]",
            "str lr,  [x0, #0x08]",
            "str fp,  [x0, #0x10]",
            "str x19, [x0, #0x18]",
            "str x20, [x0, #0x20]",
            "str x21, [x0, #0x28]",
            "str x22, [x0, #0x30]",
            "str x23, [x0, #0x38]",
            "str x24, [x0, #0x40]",
            "str x25, [x0, #0x48]",
            "str x26, [x0, #0x50]",
            "str x27, [x0, #0x58]",
            "str x28, [x0, #0x60]",
            "str d8,  [x0, #0x68]",
            "str d9,  [x0, #0x70]",
            "str d10, [x0, #0x78]",
            "str d11, [x0, #0x80]",
            "str d12, [x0, #0x88]",
            "str d13, [x0, #0x90]",
            "str d14, [x0, #0x98]",
            "str d15, [x0, #0xa0]",
            "ldr x9,  [x1, #0x00]",
            "mov sp, x9",
            "ldr lr,  [x1, #0x08]",
            "ldr fp,  [x1, #0x10]",
            "ldr x19, [x1, #0x18]",
            "ldr x20, [x1, #0x20]",
            "ldr x21, [x1, #0x28]",
            "ldr x22, [x1, #0x30]",
            "ldr x23, [x1, #0x38]",
            "ldr x24, [x1, #0x40]",
            "ldr x25, [x1, #0x48]",
            "ldr x26, [x1, #0x50]",
            "ldr x27, [x1, #0x58]",
            "ldr x28, [x1, #0x60]",
            "ldr d8,  [x1, #0x68]",
            "ldr d9,  [x1, #0x70]",
            "ldr d10, [x1, #0x78]",
            "ldr d11, [x1, #0x80]",
            "ldr d12, [x1, #0x88]",
            "ldr d13, [x1, #0x90]",
            "ldr d14, [x1, #0x98]",
            "ldr d15, [x1, #0xa0]",
            "ret",
        );
    }
}

pub use arch::{ExecutionContext, entry_arg, switch};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_is_empty() {
        let ctx = ExecutionContext::default();
        assert_eq!(ctx.stack_pointer(), 0);
    }

    #[test]
    fn entry_context_points_into_its_stack() {
        let mut stack = vec![0u8; 4096];
        let top = (stack.as_mut_ptr() as usize + stack.len()) & !0xF;
        let ctx = unsafe { ExecutionContext::for_entry(top, 0x1000, 7) };
        let sp = ctx.stack_pointer();
        assert!(sp <= top);
        assert!(sp >= top - 16);
        assert_eq!(sp % 16, 0);
    }
}
