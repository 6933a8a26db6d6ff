use super::cr::register_view;

register_view! {
    /// Extended Feature Enable Register (`IA32_EFER`).
    MsrEfer {
        /// `syscall`/`sysret` enabled (SCE).
        syscall_enable = 0,

        /// Long mode requested (LME). Becomes active once paging is on.
        long_mode_enable = 8,

        /// Long mode active (LMA).
        long_mode_active = 10,

        /// No-execute page protection (NXE).
        execute_disable = 11,
    }
}
