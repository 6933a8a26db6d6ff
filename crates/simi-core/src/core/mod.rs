mod access_context;
mod address;
mod address_context;
mod cpu;
mod info;
pub(crate) mod macros;
mod memory_access;

pub use self::{
    access_context::AccessContext,
    address::{Gfn, Pa, Va},
    address_context::AddressContext,
    cpu::CpuId,
    info::SimInfo,
    memory_access::MemoryAccess,
};
