/// Declares a register view over a raw `u64` with single-bit accessors.
macro_rules! register_view {
    (
        $(#[$meta:meta])*
        $name:ident {
            $(
                $(#[$fmeta:meta])*
                $field:ident = $bit:literal,
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Default, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub u64);

        impl $name {
            $(
                $(#[$fmeta])*
                pub fn $field(self) -> bool {
                    (self.0 >> $bit) & 1 != 0
                }
            )*
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    $(.field(stringify!($field), &self.$field()))*
                    .finish()
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

pub(crate) use register_view;

register_view! {
    /// `CR0` control register.
    ///
    /// Only the bits that decide how linear addresses are translated are
    /// decoded.
    Cr0 {
        /// Protected mode (PE).
        protection_enable = 0,

        /// Supervisor writes honor read-only pages (WP).
        write_protect = 16,

        /// Paging (PG). Has no effect unless PE is also set.
        paging = 31,
    }
}

register_view! {
    /// `CR4` control register.
    Cr4 {
        /// 4 MiB pages with 32-bit paging (PSE).
        page_size_extension = 4,

        /// 64-bit page table entries (PAE). Required for IA-32e paging.
        physical_address_extension = 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_bits() {
        let cr0 = Cr0(0x8000_0011);
        assert!(cr0.paging());
        assert!(cr0.protection_enable());
        assert!(!cr0.write_protect());

        let cr4 = Cr4::from(0x30);
        assert!(cr4.page_size_extension());
        assert!(cr4.physical_address_extension());
        assert_eq!(u64::from(cr4), 0x30);
    }
}
