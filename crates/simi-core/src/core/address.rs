use super::macros::guest_address;

guest_address!(Gfn, "guest frame number");
guest_address!(Pa, "guest physical address");
guest_address!(Va, "guest virtual address");

impl Va {
    /// Checks whether the address is zero.
    ///
    /// Kernel list heads and task pointers read from a half-initialised
    /// guest are routinely zero.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}
