//! Sampler objects.

use crate::context::Context;
use crate::device::NativeDevice;
use crate::error::Result;
use crate::refs::{InternalRef, OwnedRef};

use rocl_engine::{CpuSlot, ImmediateContext};
use rocl_hal::{AddressMode, Backend, Descriptor, DescriptorKind, FilterMode, SamplerDesc};

use parking_lot::Mutex;
use std::sync::Arc;

/// An immutable sampler plus its lazily created device descriptor.
pub struct Sampler<B: Backend> {
    context: InternalRef<Context<B>>,
    desc: SamplerDesc,
    slots: Mutex<Vec<(Arc<NativeDevice<B>>, CpuSlot)>>,
}

impl<B: Backend> Sampler<B> {
    pub fn create(
        context: &OwnedRef<Context<B>>,
        normalized_coords: bool,
        address_mode: AddressMode,
        filter: FilterMode,
    ) -> OwnedRef<Sampler<B>> {
        OwnedRef::new(Sampler {
            context: context.internal(),
            desc: SamplerDesc {
                address_mode,
                filter,
                normalized_coords,
            },
            slots: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &InternalRef<Context<B>> {
        &self.context
    }

    pub fn desc(&self) -> SamplerDesc {
        self.desc
    }

    /// CL-encoded addressing mode, for the specialization key.
    pub fn addressing_mode_bits(&self) -> u32 {
        match self.desc.address_mode {
            AddressMode::None => 0,
            AddressMode::ClampToEdge => 2,
            AddressMode::ClampToBorder => 3,
            AddressMode::Repeat => 4,
            AddressMode::MirroredRepeat => 5,
        }
    }

    pub(crate) fn descriptor_slot(
        &self,
        native: &Arc<NativeDevice<B>>,
        ctx: &mut ImmediateContext<B>,
    ) -> Result<CpuSlot> {
        let mut slots = self.slots.lock();
        if let Some((_, slot)) = slots.iter().find(|(n, _)| Arc::ptr_eq(n, native)) {
            return Ok(*slot);
        }
        let _ = ctx;
        let resources = native.resources();
        let slot = resources.allocate_descriptor(DescriptorKind::Sampler)?;
        resources.write_descriptor(
            DescriptorKind::Sampler,
            slot,
            Descriptor::Sampler(self.desc),
        );
        slots.push((Arc::clone(native), slot));
        Ok(slot)
    }
}

impl<B: Backend> Drop for Sampler<B> {
    fn drop(&mut self) {
        for (native, slot) in self.slots.get_mut().iter() {
            native
                .resources()
                .free_descriptor(DescriptorKind::Sampler, *slot);
        }
    }
}

impl<B: Backend> std::fmt::Debug for Sampler<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Sampler").field("desc", &self.desc).finish()
    }
}
