// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM 2.0 Command Response Buffer (CRB) device.
//!
//! [`TpmCrb`] is the device shell around a [`CrbCore`] (the register-level
//! CRB interface) and an optional [`PpiBuilder`] (the physical presence
//! interface). When realized on a [`Platform`] it:
//!
//! - enforces that the platform has at most one TPM and that a backend is
//!   bound,
//! - maps the CRB register window and the PPI region at their fixed guest
//!   physical addresses,
//! - arranges for the device to be reset, either right away or on every
//!   platform reset depending on the [`Hypervisor`],
//! - forwards backend command completions to the core,
//! - and describes itself to the guest in the DSDT.

#![forbid(unsafe_code)]

mod aml;
pub mod backend;
pub mod crb;
pub mod ppi;
pub mod resolver;

use crate::backend::CompletionReceiver;
use crate::backend::CompletionSender;
use crate::backend::TpmBackend;
use crate::backend::TpmVersion;
use crate::backend::completion_channel;
use crate::crb::CrbCore;
use crate::crb::CrbCoreError;
use crate::crb::CrbEngine;
use crate::crb::PreSaveFailed;
use crate::ppi::PpiBuilder;
use crate::ppi::PpiRegion;
use chipset_device::ChipsetDevice;
use chipset_device::poll_device::PollDevice;
use parking_lot::Mutex;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use thiserror::Error;
use vmotherboard::Hypervisor;
use vmotherboard::IoRangeConflict;
use vmotherboard::MappedRegion;
use vmotherboard::Platform;
use vmotherboard::poll::PollRegistration;
use vmotherboard::registry::AlreadyClaimed;
use vmotherboard::registry::DeviceClaim;
use vmotherboard::reset::ResetRegistration;

/// Guest physical base of the CRB register window.
pub const TPM_CRB_ADDR_BASE: u64 = 0xfed4_0000;
/// Size of the CRB register window.
pub const TPM_CRB_ADDR_SIZE: u64 = 0x1000;
/// Guest physical base of the PPI region.
pub const TPM_PPI_ADDR_BASE: u64 = 0xfed4_5000;
/// Size of the PPI region.
pub const TPM_PPI_ADDR_SIZE: u64 = 0x400;

/// The device class claimed in the platform registry. Shared by every TPM
/// interface, so a CRB device also excludes any other kind of TPM.
pub const TPM_DEVICE_CLASS: &str = "tpm";

const CRB_REGION_NAME: &str = "tpm-crb-mmio";
const PPI_REGION_NAME: &str = "tpm-ppi";

/// How the device gets its first (and subsequent) resets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetTrigger {
    /// Reset once, synchronously, while realizing.
    Immediate,
    /// Reset on every platform reset.
    DispatcherRegistered,
}

impl ResetTrigger {
    pub fn for_hypervisor(hypervisor: Hypervisor) -> Self {
        match hypervisor {
            Hypervisor::Xen => ResetTrigger::Immediate,
            Hypervisor::Standard => ResetTrigger::DispatcherRegistered,
        }
    }
}

/// Device configuration.
#[derive(Clone)]
pub struct TpmCrbConfig {
    /// The TPM commands are forwarded to. Required to realize the device.
    pub backend: Option<Arc<dyn TpmBackend>>,
    /// Expose the physical presence interface.
    pub ppi: bool,
}

impl std::fmt::Debug for TpmCrbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpmCrbConfig")
            .field(
                "backend",
                &self.backend.as_ref().map(|backend| backend.version()),
            )
            .field("ppi", &self.ppi)
            .finish()
    }
}

impl Default for TpmCrbConfig {
    fn default() -> Self {
        Self {
            backend: None,
            ppi: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum RealizeError {
    #[error("device is already realized")]
    AlreadyRealized,
    #[error("at most one TPM device is permitted")]
    SingletonViolation(#[source] AlreadyClaimed),
    #[error("'tpmdev' property is required")]
    MissingBackend,
    #[error("failed to initialize the crb interface")]
    InitMemory(#[source] CrbCoreError),
    #[error("failed to map the {region} region")]
    MapRegion {
        region: &'static str,
        #[source]
        source: IoRangeConflict,
    },
}

/// Everything a realized device holds on the platform. Dropping it unmaps
/// the regions, removes the reset and poll registrations and releases the
/// TPM claim.
struct Realized {
    trigger: ResetTrigger,
    _poll: PollRegistration,
    _reset: Option<ResetRegistration>,
    _regions: Vec<MappedRegion>,
    _claim: DeviceClaim,
}

/// A TPM CRB device.
pub struct TpmCrb<C, P> {
    // Static configuration
    name: Arc<str>,
    backend: Option<Arc<dyn TpmBackend>>,

    // Sub-emulators
    core: Arc<Mutex<C>>,
    ppi: Option<Arc<Mutex<P>>>,

    // Runtime glue
    completion_send: CompletionSender,
    forwarder: Arc<Mutex<CompletionForwarder<C>>>,
    realized: Option<Realized>,
}

/// Applies backend completions to the core. Registered with the platform
/// poll dispatcher, so completions land on the control thread.
struct CompletionForwarder<C> {
    name: Arc<str>,
    core: Arc<Mutex<C>>,
    completions: CompletionReceiver,
}

impl<C: CrbCore> CompletionForwarder<C> {
    fn forward(&mut self, result_code: i32) {
        tracing::trace!(device = &*self.name, result_code, "tpm command completed");
        self.core.lock().request_completed(result_code);
    }

    /// Forwards the completions already queued, without waiting.
    fn drain(&mut self) {
        while let Some(result_code) = self.completions.try_recv() {
            self.forward(result_code);
        }
    }
}

impl<C: CrbCore> ChipsetDevice for CompletionForwarder<C> {
    fn supports_poll_device(&mut self) -> Option<&mut dyn PollDevice> {
        Some(self)
    }
}

impl<C: CrbCore> PollDevice for CompletionForwarder<C> {
    fn poll_device(&mut self, cx: &mut Context<'_>) {
        while let Poll::Ready(Some(result_code)) = self.completions.poll_next(cx) {
            self.forward(result_code);
        }
    }
}

impl TpmCrb<CrbEngine, PpiRegion> {
    /// Returns a device backed by the register-level CRB implementation and
    /// a RAM-backed PPI region.
    pub fn with_config(name: impl Into<Arc<str>>, config: TpmCrbConfig) -> Self {
        Self::new(
            name,
            config,
            CrbEngine::new(),
            PpiRegion::new(TPM_PPI_ADDR_BASE),
        )
    }
}

fn reset_device<C: CrbCore, P: PpiBuilder>(core: &Mutex<C>, ppi: Option<&Mutex<P>>) {
    if let Some(ppi) = ppi {
        ppi.lock().reset();
    }
    core.lock().reset(TPM_CRB_ADDR_BASE);
}

impl<C: CrbCore, P: PpiBuilder> TpmCrb<C, P> {
    /// Returns a new, unrealized device. `ppi` is discarded if the
    /// configuration disables PPI.
    pub fn new(name: impl Into<Arc<str>>, config: TpmCrbConfig, core: C, ppi: P) -> Self {
        let TpmCrbConfig {
            backend,
            ppi: ppi_enabled,
        } = config;
        let name: Arc<str> = name.into();
        let core = Arc::new(Mutex::new(core));
        let (completion_send, completions) = completion_channel();
        let forwarder = CompletionForwarder {
            name: name.clone(),
            core: core.clone(),
            completions,
        };
        Self {
            name,
            backend,
            core,
            ppi: ppi_enabled.then(|| Arc::new(Mutex::new(ppi))),
            completion_send,
            forwarder: Arc::new(Mutex::new(forwarder)),
            realized: None,
        }
    }

    /// Validates the configuration and attaches the device to `platform`.
    ///
    /// On failure nothing stays mapped or registered, and the device may be
    /// realized again.
    pub fn realize(&mut self, platform: &Platform) -> Result<(), RealizeError> {
        if self.realized.is_some() {
            return Err(RealizeError::AlreadyRealized);
        }

        let claim = platform
            .registry()
            .claim(TPM_DEVICE_CLASS, self.name.clone())
            .map_err(RealizeError::SingletonViolation)?;

        let backend = self.backend.clone().ok_or(RealizeError::MissingBackend)?;

        let size = self
            .core
            .lock()
            .init_memory(backend, self.completion_send.clone())
            .map_err(RealizeError::InitMemory)?;
        if size != TPM_CRB_ADDR_SIZE {
            return Err(RealizeError::InitMemory(CrbCoreError::WindowSize {
                size,
                expected: TPM_CRB_ADDR_SIZE,
            }));
        }

        let chipset = platform.chipset();
        let mut regions = Vec::new();

        let core: Arc<Mutex<dyn ChipsetDevice>> = self.core.clone();
        let crb = chipset
            .map_mmio(
                self.name.clone(),
                CRB_REGION_NAME,
                TPM_CRB_ADDR_BASE..=TPM_CRB_ADDR_BASE + TPM_CRB_ADDR_SIZE - 1,
                Arc::downgrade(&core),
            )
            .map_err(|source| RealizeError::MapRegion {
                region: CRB_REGION_NAME,
                source,
            })?;
        regions.push(crb);

        if let Some(ppi) = &self.ppi {
            let ppi: Arc<Mutex<dyn ChipsetDevice>> = ppi.clone();
            match chipset.map_mmio(
                self.name.clone(),
                PPI_REGION_NAME,
                TPM_PPI_ADDR_BASE..=TPM_PPI_ADDR_BASE + TPM_PPI_ADDR_SIZE - 1,
                Arc::downgrade(&ppi),
            ) {
                Ok(region) => regions.push(region),
                Err(source) => {
                    tracing::warn!(
                        device = &*self.name,
                        error = &source as &dyn std::error::Error,
                        "failed to map ppi region, unmapping crb window"
                    );
                    return Err(RealizeError::MapRegion {
                        region: PPI_REGION_NAME,
                        source,
                    });
                }
            }
        }

        let forwarder: Arc<Mutex<dyn ChipsetDevice>> = self.forwarder.clone();
        let poll = platform
            .poll_dispatcher()
            .register(self.name.clone(), Arc::downgrade(&forwarder));

        let trigger = ResetTrigger::for_hypervisor(platform.hypervisor());
        let reset = match trigger {
            ResetTrigger::Immediate => {
                reset_device(&self.core, self.ppi.as_deref());
                None
            }
            ResetTrigger::DispatcherRegistered => {
                let core = self.core.clone();
                let ppi = self.ppi.clone();
                Some(
                    platform
                        .reset_dispatcher()
                        .register(self.name.clone(), move || {
                            reset_device(&core, ppi.as_deref())
                        }),
                )
            }
        };

        tracing::info!(
            device = &*self.name,
            ?trigger,
            ppi = self.ppi.is_some(),
            "tpm crb realized"
        );

        self.realized = Some(Realized {
            trigger,
            _poll: poll,
            _reset: reset,
            _regions: regions,
            _claim: claim,
        });
        Ok(())
    }

    /// Detaches the device from the platform it was realized on.
    pub fn unrealize(&mut self) {
        if self.realized.take().is_some() {
            tracing::info!(device = &*self.name, "tpm crb unrealized");
        }
    }

    pub fn is_realized(&self) -> bool {
        self.realized.is_some()
    }

    /// The reset trigger chosen at realize time.
    pub fn reset_trigger(&self) -> Option<ResetTrigger> {
        self.realized.as_ref().map(|realized| realized.trigger)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> TpmVersion {
        self.core.lock().version()
    }

    pub fn core(&self) -> &Arc<Mutex<C>> {
        &self.core
    }

    pub fn ppi(&self) -> Option<&Arc<Mutex<P>>> {
        self.ppi.as_ref()
    }

    /// Forwards a command completion from the backend to the core.
    pub fn on_backend_completed(&mut self, result_code: i32) {
        self.forwarder.lock().forward(result_code);
    }

    /// Prepares the device for a snapshot.
    pub fn pre_save(&mut self) -> Result<(), PreSaveFailed> {
        self.core.lock().pre_save()?;
        // Apply any completion the backend delivered while the core waited,
        // so the core's saved state is quiescent.
        self.forwarder.lock().drain();
        Ok(())
    }
}

impl<C: CrbCore, P: PpiBuilder> ChipsetDevice for TpmCrb<C, P> {
    fn supports_poll_device(&mut self) -> Option<&mut dyn PollDevice> {
        Some(self)
    }
}

impl<C: CrbCore, P: PpiBuilder> PollDevice for TpmCrb<C, P> {
    fn poll_device(&mut self, cx: &mut Context<'_>) {
        self.forwarder.lock().poll_device(cx);
    }
}

mod save_restore {
    use super::*;
    use vmcore::save_restore::RestoreError;
    use vmcore::save_restore::SaveError;
    use vmcore::save_restore::SaveRestore;

    mod state {
        use serde::Deserialize;
        use serde::Serialize;
        use vmcore::save_restore::SavedStateRoot;

        /// The device shell has no state of its own.
        #[derive(Serialize, Deserialize)]
        pub struct SavedState;

        impl SavedStateRoot for SavedState {
            const NAME: &'static str = "tpm-crb";
            const VERSION: u32 = 1;
        }
    }

    impl<C: CrbCore, P: PpiBuilder> SaveRestore for TpmCrb<C, P> {
        type SavedState = state::SavedState;

        fn save(&mut self) -> Result<Self::SavedState, SaveError> {
            self.pre_save().map_err(|err| {
                tracing::warn!(
                    device = &*self.name,
                    error = &err as &dyn std::error::Error,
                    "tpm crb pre-save failed"
                );
                SaveError::Other(err.into())
            })?;
            Ok(state::SavedState)
        }

        fn restore(&mut self, state: Self::SavedState) -> Result<(), RestoreError> {
            let state::SavedState = state;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::TestBackend;
    use acpi::dsdt::Device;
    use acpi::dsdt::DsdtObject;
    use acpi::dsdt::NamedInteger;
    use acpi::dsdt::Scope;
    use std::future::poll_fn;
    use test_with_tracing::test;
    use vmcore::save_restore::DynSaveRestore;
    use vmcore::save_restore::SaveError;
    use vmotherboard::snapshot::Snapshot;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        InitMemory,
        Reset(u64),
        Completed(i32),
        PreSave,
        PpiReset,
        PpiFragment,
    }

    type Events = Arc<Mutex<Vec<Event>>>;

    struct FakeCore {
        events: Events,
        version: TpmVersion,
        pre_save_status: i32,
        fail_init: bool,
        window_size: u64,
        owner: Option<CompletionSender>,
    }

    impl ChipsetDevice for FakeCore {}

    impl CrbCore for FakeCore {
        fn init_memory(
            &mut self,
            _backend: Arc<dyn TpmBackend>,
            owner: CompletionSender,
        ) -> Result<u64, CrbCoreError> {
            if self.fail_init {
                return Err(CrbCoreError::BufferTooSmall(0));
            }
            self.events.lock().push(Event::InitMemory);
            self.owner = Some(owner);
            Ok(self.window_size)
        }

        fn reset(&mut self, base: u64) {
            self.events.lock().push(Event::Reset(base));
        }

        fn version(&self) -> TpmVersion {
            self.version
        }

        fn request_completed(&mut self, result_code: i32) {
            self.events.lock().push(Event::Completed(result_code));
        }

        fn pre_save(&mut self) -> Result<(), PreSaveFailed> {
            self.events.lock().push(Event::PreSave);
            if self.pre_save_status != 0 {
                return Err(PreSaveFailed(self.pre_save_status));
            }
            Ok(())
        }
    }

    struct FakePpi {
        events: Events,
    }

    impl ChipsetDevice for FakePpi {}

    impl PpiBuilder for FakePpi {
        fn reset(&mut self) {
            self.events.lock().push(Event::PpiReset);
        }

        fn build_firmware_fragment(&self, device: &mut Device) {
            self.events.lock().push(Event::PpiFragment);
            device.add_object(&NamedInteger::new(b"PPIF", 7));
        }
    }

    fn backend(version: TpmVersion) -> Arc<dyn TpmBackend> {
        Arc::new(TestBackend::new(version))
    }

    fn config(ppi: bool) -> TpmCrbConfig {
        TpmCrbConfig {
            backend: Some(backend(TpmVersion::V2_0)),
            ppi,
        }
    }

    fn fake_device(name: &str, config: TpmCrbConfig) -> (TpmCrb<FakeCore, FakePpi>, Events) {
        let events = Events::default();
        let core = FakeCore {
            events: events.clone(),
            version: TpmVersion::V2_0,
            pre_save_status: 0,
            fail_init: false,
            window_size: TPM_CRB_ADDR_SIZE,
            owner: None,
        };
        let ppi = FakePpi {
            events: events.clone(),
        };
        (TpmCrb::new(name, config, core, ppi), events)
    }

    fn regions(platform: &Platform) -> Vec<(String, std::ops::RangeInclusive<u64>)> {
        platform
            .chipset()
            .mmio_regions()
            .into_iter()
            .map(|r| (r.region_name.to_string(), r.range))
            .collect()
    }

    fn tpm_regions() -> Vec<(String, std::ops::RangeInclusive<u64>)> {
        vec![
            ("tpm-crb-mmio".to_owned(), 0xfed4_0000..=0xfed4_0fff),
            ("tpm-ppi".to_owned(), 0xfed4_5000..=0xfed4_53ff),
        ]
    }

    fn aml(dev: &TpmCrb<impl CrbCore, impl PpiBuilder>) -> Vec<u8> {
        let mut scope = Scope::new(b"\\_SB");
        dev.build_dev_aml(&mut scope);
        scope.to_bytes()
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn realize_maps_fixed_regions() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut dev, events) = fake_device("tpm0", config(true));
        dev.realize(&platform).unwrap();

        assert!(dev.is_realized());
        assert_eq!(regions(&platform), tpm_regions());
        assert_eq!(platform.registry().owner(TPM_DEVICE_CLASS).as_deref(), Some("tpm0"));
        // Nothing guest visible happens until the first reset.
        assert_eq!(*events.lock(), [Event::InitMemory]);
    }

    #[test]
    fn second_tpm_is_rejected() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut first, _) = fake_device("tpm0", config(true));
        first.realize(&platform).unwrap();

        let (mut second, events) = fake_device("tpm1", config(true));
        let err = second.realize(&platform).unwrap_err();
        assert!(matches!(err, RealizeError::SingletonViolation(_)));
        assert_eq!(err.to_string(), "at most one TPM device is permitted");

        assert!(events.lock().is_empty());
        assert!(!second.is_realized());
        assert_eq!(regions(&platform), tpm_regions());
        assert_eq!(platform.reset_dispatcher().registered().len(), 1);
    }

    #[test]
    fn missing_backend_is_rejected() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut dev, events) = fake_device("tpm0", TpmCrbConfig::default());
        let err = dev.realize(&platform).unwrap_err();
        assert!(matches!(err, RealizeError::MissingBackend));
        assert_eq!(err.to_string(), "'tpmdev' property is required");

        assert!(events.lock().is_empty());
        assert!(regions(&platform).is_empty());
        assert!(platform.registry().owner(TPM_DEVICE_CLASS).is_none());
        assert!(platform.reset_dispatcher().registered().is_empty());
    }

    #[test]
    fn init_memory_failure_is_rejected() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut dev, _) = fake_device("tpm0", config(true));
        dev.core().lock().fail_init = true;
        let err = dev.realize(&platform).unwrap_err();
        assert!(matches!(err, RealizeError::InitMemory(_)));
        assert!(regions(&platform).is_empty());
        assert!(platform.registry().owner(TPM_DEVICE_CLASS).is_none());
    }

    #[test]
    fn crb_window_size_is_fixed() {
        for size in [0, 0x800, 0x2000] {
            let platform = Platform::new(Hypervisor::Standard);
            let (mut dev, _) = fake_device("tpm0", config(true));
            dev.core().lock().window_size = size;
            let err = dev.realize(&platform).unwrap_err();
            assert!(
                matches!(
                    err,
                    RealizeError::InitMemory(CrbCoreError::WindowSize { size: s, expected: 0x1000 })
                        if s == size
                ),
                "{err:?}"
            );
            assert!(regions(&platform).is_empty());
            assert!(platform.registry().owner(TPM_DEVICE_CLASS).is_none());
            assert!(platform.poll_dispatcher().registered().is_empty());
        }
    }

    #[test]
    fn crb_window_matches_firmware_description() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut dev, _) = fake_device("tpm0", config(false));
        dev.realize(&platform).unwrap();
        let mapped = platform.chipset().mmio_regions()[0].range.clone();
        assert_eq!(
            mapped,
            TPM_CRB_ADDR_BASE..=TPM_CRB_ADDR_BASE + TPM_CRB_ADDR_SIZE - 1
        );

        let base = (TPM_CRB_ADDR_BASE as u32).to_le_bytes();
        let len = (TPM_CRB_ADDR_SIZE as u32).to_le_bytes();
        let mut memory32 = vec![0x86, 9, 0, 1];
        memory32.extend_from_slice(&base);
        memory32.extend_from_slice(&len);
        assert!(contains(&aml(&dev), &memory32));
    }

    #[test]
    fn ppi_disabled_maps_only_crb() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut dev, events) = fake_device("tpm0", config(false));
        dev.realize(&platform).unwrap();
        assert_eq!(regions(&platform), tpm_regions()[..1]);
        assert!(dev.ppi().is_none());

        platform.reset();
        let bytes = aml(&dev);
        assert!(!contains(&bytes, b"PPIF"));
        assert_eq!(
            *events.lock(),
            [Event::InitMemory, Event::Reset(TPM_CRB_ADDR_BASE)]
        );
    }

    #[test]
    fn ppi_conflict_rolls_back() {
        let platform = Platform::new(Hypervisor::Standard);
        let squatter: Arc<Mutex<dyn ChipsetDevice>> = Arc::new(Mutex::new(FakePpi {
            events: Events::default(),
        }));
        let squatter_region = platform
            .chipset()
            .map_mmio(
                "other",
                "ram",
                0xfed4_5000..=0xfed4_5fff,
                Arc::downgrade(&squatter),
            )
            .unwrap();

        let (mut dev, _) = fake_device("tpm0", config(true));
        let err = dev.realize(&platform).unwrap_err();
        assert!(matches!(
            err,
            RealizeError::MapRegion {
                region: "tpm-ppi",
                ..
            }
        ));
        assert!(!dev.is_realized());
        assert_eq!(
            regions(&platform),
            [("ram".to_owned(), 0xfed4_5000..=0xfed4_5fff)]
        );
        assert!(platform.registry().owner(TPM_DEVICE_CLASS).is_none());
        assert!(platform.reset_dispatcher().registered().is_empty());

        drop(squatter_region);
        dev.realize(&platform).unwrap();
        assert_eq!(regions(&platform), tpm_regions());
    }

    #[test]
    fn standard_hypervisor_resets_on_platform_reset() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut dev, events) = fake_device("tpm0", config(true));
        dev.realize(&platform).unwrap();
        assert_eq!(
            dev.reset_trigger(),
            Some(ResetTrigger::DispatcherRegistered)
        );
        assert_eq!(platform.reset_dispatcher().registered(), [Arc::<str>::from("tpm0")]);

        platform.reset();
        platform.reset();
        assert_eq!(
            *events.lock(),
            [
                Event::InitMemory,
                Event::PpiReset,
                Event::Reset(TPM_CRB_ADDR_BASE),
                Event::PpiReset,
                Event::Reset(TPM_CRB_ADDR_BASE),
            ]
        );
    }

    #[test]
    fn xen_resets_once_at_realize() {
        let platform = Platform::new(Hypervisor::Xen);
        let (mut dev, events) = fake_device("tpm0", config(true));
        dev.realize(&platform).unwrap();
        assert_eq!(dev.reset_trigger(), Some(ResetTrigger::Immediate));
        assert!(platform.reset_dispatcher().registered().is_empty());

        platform.reset();
        assert_eq!(
            *events.lock(),
            [
                Event::InitMemory,
                Event::PpiReset,
                Event::Reset(TPM_CRB_ADDR_BASE),
            ]
        );
    }

    #[test]
    fn realize_twice_fails() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut dev, _) = fake_device("tpm0", config(true));
        dev.realize(&platform).unwrap();
        assert!(matches!(
            dev.realize(&platform),
            Err(RealizeError::AlreadyRealized)
        ));
        assert_eq!(regions(&platform), tpm_regions());
    }

    #[test]
    fn teardown_releases_platform_resources() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut dev, events) = fake_device("tpm0", config(true));
        dev.realize(&platform).unwrap();
        dev.unrealize();

        assert!(regions(&platform).is_empty());
        assert!(platform.registry().owner(TPM_DEVICE_CLASS).is_none());
        assert!(platform.reset_dispatcher().registered().is_empty());
        assert!(platform.poll_dispatcher().registered().is_empty());
        platform.reset();
        assert_eq!(platform.poll_dispatcher().run_pending(), 0);
        assert_eq!(*events.lock(), [Event::InitMemory]);

        let (mut other, _) = fake_device("tpm1", config(true));
        other.realize(&platform).unwrap();
        drop(other);
        assert!(regions(&platform).is_empty());
    }

    #[test]
    async fn completions_are_forwarded_in_order() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut dev, events) = fake_device("tpm0", config(true));
        dev.realize(&platform).unwrap();

        let owner = dev.core().lock().owner.clone().unwrap();
        let thread = std::thread::spawn(move || {
            for code in [0, 3, -1, 0] {
                owner.complete(code);
            }
        });

        poll_fn(|cx| {
            dev.poll_device(cx);
            let completed = events
                .lock()
                .iter()
                .filter(|event| matches!(event, Event::Completed(_)))
                .count();
            if completed == 4 {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await;
        thread.join().unwrap();

        assert_eq!(
            *events.lock(),
            [
                Event::InitMemory,
                Event::Completed(0),
                Event::Completed(3),
                Event::Completed(-1),
                Event::Completed(0),
            ]
        );
    }

    #[test]
    async fn completions_are_delivered_by_the_platform() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut dev, events) = fake_device("tpm0", config(true));
        dev.realize(&platform).unwrap();
        let polls = platform.poll_dispatcher();
        assert_eq!(polls.registered(), [Arc::<str>::from("tpm0")]);

        // The first poll arms the completion channel's waker.
        polls.wait().await;
        assert_eq!(polls.run_pending(), 1);

        let owner = dev.core().lock().owner.clone().unwrap();
        let thread = std::thread::spawn(move || owner.complete(-3));
        while !events.lock().contains(&Event::Completed(-3)) {
            polls.wait().await;
            polls.run_pending();
        }
        thread.join().unwrap();
        assert_eq!(*events.lock(), [Event::InitMemory, Event::Completed(-3)]);

        dev.unrealize();
        assert!(polls.registered().is_empty());
    }

    #[test]
    fn direct_completion_is_forwarded_unchanged() {
        let (mut dev, events) = fake_device("tpm0", config(true));
        dev.on_backend_completed(i32::MIN);
        assert_eq!(*events.lock(), [Event::Completed(i32::MIN)]);
    }

    #[test]
    fn pre_save_failure_fails_snapshot() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut dev, _) = fake_device("tpm0", config(true));
        dev.core().lock().pre_save_status = -16;
        dev.realize(&platform).unwrap();

        assert!(matches!(dev.pre_save(), Err(PreSaveFailed(-16))));

        let err = Snapshot::capture([("tpm0", &mut dev as &mut dyn DynSaveRestore)]).unwrap_err();
        assert!(matches!(err, SaveError::ChildError(ref name, _) if name == "tpm0"));
    }

    #[test]
    fn snapshot_records_empty_state_after_pre_save() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut dev, events) = fake_device("tpm0", config(true));
        dev.realize(&platform).unwrap();

        // A completion queued before the snapshot is applied by pre-save.
        dev.core().lock().owner.clone().unwrap().complete(0);
        let snapshot =
            Snapshot::capture([("tpm0", &mut dev as &mut dyn DynSaveRestore)]).unwrap();
        assert_eq!(snapshot.entries()[0].state.name(), "tpm-crb");
        assert_eq!(snapshot.entries()[0].state.version(), 1);
        assert_eq!(
            *events.lock(),
            [Event::InitMemory, Event::PreSave, Event::Completed(0)]
        );

        snapshot
            .restore([("tpm0", &mut dev as &mut dyn DynSaveRestore)])
            .unwrap();
    }

    #[test]
    fn saved_state_survives_encoding() {
        let backend = Arc::new(TestBackend::new(TpmVersion::V2_0));
        let config = TpmCrbConfig {
            backend: Some(backend),
            ppi: true,
        };

        let platform = Platform::new(Hypervisor::Standard);
        let mut dev = TpmCrb::with_config("tpm0", config.clone());
        dev.realize(&platform).unwrap();
        platform.reset();
        let chipset = platform.chipset();
        chipset.mmio_write(TPM_CRB_ADDR_BASE + 0x08, &1u32.to_le_bytes());
        chipset.mmio_write(TPM_CRB_ADDR_BASE + 0x80, &[0x80, 0x01, 0, 0]);
        chipset.mmio_write(TPM_PPI_ADDR_BASE + 0x15a, &[1]);

        let shell = Snapshot::capture([("tpm0", &mut dev as &mut dyn DynSaveRestore)])
            .unwrap()
            .to_bytes()
            .unwrap();
        let core = dev.core().clone();
        let ppi = dev.ppi().unwrap().clone();
        let parts = Snapshot::capture([
            ("tpm0.core", &mut *core.lock() as &mut dyn DynSaveRestore),
            ("tpm0.ppi", &mut *ppi.lock() as &mut dyn DynSaveRestore),
        ])
        .unwrap()
        .to_bytes()
        .unwrap();
        drop(dev);

        let platform = Platform::new(Hypervisor::Standard);
        let mut restored = TpmCrb::with_config("tpm0", config);
        restored.realize(&platform).unwrap();
        Snapshot::from_bytes(&shell)
            .unwrap()
            .restore([("tpm0", &mut restored as &mut dyn DynSaveRestore)])
            .unwrap();

        let parts = Snapshot::from_bytes(&parts).unwrap();
        let records: Vec<_> = parts
            .entries()
            .iter()
            .map(|entry| (entry.state.name().to_owned(), entry.state.version()))
            .collect();
        assert_eq!(
            records,
            [("tpm-crb.core".to_owned(), 1), ("tpm-crb.ppi".to_owned(), 1)]
        );
        let core = restored.core().clone();
        let ppi = restored.ppi().unwrap().clone();
        parts
            .restore([
                ("tpm0.core", &mut *core.lock() as &mut dyn DynSaveRestore),
                ("tpm0.ppi", &mut *ppi.lock() as &mut dyn DynSaveRestore),
            ])
            .unwrap();

        let chipset = platform.chipset();
        let read32 = |addr: u64| {
            let mut data = [0; 4];
            chipset.mmio_read(addr, &mut data);
            u32::from_le_bytes(data)
        };
        assert_eq!(read32(TPM_CRB_ADDR_BASE), 0x83);
        assert_eq!(read32(TPM_CRB_ADDR_BASE + 0x80), 0x0000_0180);
        assert_eq!(read32(TPM_PPI_ADDR_BASE + 0x158) >> 16, 1);
    }

    #[test]
    fn aml_for_tpm2() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut dev, events) = fake_device("tpm0", config(false));
        dev.realize(&platform).unwrap();

        #[rustfmt::skip]
        let expected: &[u8] = &[
            0x5b, 0x82, 0x4e, 0x04, b'T', b'P', b'M', b'_',
            // Name (_HID, "MSFT0101")
            0x08, b'_', b'H', b'I', b'D', 0x0d,
            b'M', b'S', b'F', b'T', b'0', b'1', b'0', b'1', 0x00,
            // Name (_STR, "TPM 2.0 Device")
            0x08, b'_', b'S', b'T', b'R', 0x0d,
            b'T', b'P', b'M', b' ', b'2', b'.', b'0', b' ',
            b'D', b'e', b'v', b'i', b'c', b'e', 0x00,
            // Name (_UID, 1)
            0x08, b'_', b'U', b'I', b'D', 0x01,
            // Name (_STA, 0xF)
            0x08, b'_', b'S', b'T', b'A', 0x0a, 0x0f,
            // Name (_CRS, ResourceTemplate () { Memory32Fixed (ReadWrite, 0xFED40000, 0x1000) })
            0x08, b'_', b'C', b'R', b'S', 0x11, 17, 0x0a, 14,
            0x86, 9, 0, 1, 0x00, 0x00, 0xd4, 0xfe, 0x00, 0x10, 0x00, 0x00,
            0x79, 0,
        ];
        let before = events.lock().clone();
        let bytes = aml(&dev);
        assert!(bytes.ends_with(expected), "{bytes:x?}");
        assert_eq!(*events.lock(), before);
    }

    #[test]
    fn aml_for_tpm12_with_ppi() {
        let platform = Platform::new(Hypervisor::Standard);
        let (mut dev, events) = fake_device("tpm0", config(true));
        dev.core().lock().version = TpmVersion::V1_2;
        dev.realize(&platform).unwrap();

        let bytes = aml(&dev);
        // Name (_HID, EisaId ("PNP0C31"))
        assert!(contains(
            &bytes,
            &[0x08, b'_', b'H', b'I', b'D', 0x0c, 0x41, 0xd0, 0x0c, 0x31]
        ));
        assert!(!contains(&bytes, b"MSFT0101"));
        assert!(!contains(&bytes, b"_STR"));
        assert_eq!(
            bytes
                .windows(3)
                .filter(|w| *w == [0x86, 9, 0])
                .count(),
            1
        );
        assert!(contains(&bytes, b"PPIF"));
        assert_eq!(events.lock().last(), Some(&Event::PpiFragment));
    }

    #[test]
    async fn command_through_the_platform() {
        let platform = Platform::new(Hypervisor::Standard);
        let backend = Arc::new(TestBackend::new(TpmVersion::V2_0));
        let config = TpmCrbConfig {
            backend: Some(backend.clone()),
            ppi: true,
        };
        let mut dev = TpmCrb::with_config("tpm0", config);
        dev.realize(&platform).unwrap();
        platform.reset();

        let chipset = platform.chipset();
        let read32 = |offset: u64| {
            let mut data = [0; 4];
            chipset.mmio_read(TPM_CRB_ADDR_BASE + offset, &mut data);
            u32::from_le_bytes(data)
        };

        assert_eq!(read32(0x30), 0x0002_5811);
        chipset.mmio_write(TPM_CRB_ADDR_BASE + 0x08, &1u32.to_le_bytes());
        chipset.mmio_write(TPM_CRB_ADDR_BASE + 0x40, &1u32.to_le_bytes());
        chipset.mmio_write(
            TPM_CRB_ADDR_BASE + 0x80,
            &[0x80, 0x01, 0, 0, 0, 0x0c, 0, 0, 0x01, 0x44, 0, 0],
        );
        chipset.mmio_write(TPM_CRB_ADDR_BASE + 0x4c, &1u32.to_le_bytes());
        assert_eq!(read32(0x4c), 1);

        let cmd = backend.take_command().unwrap();
        assert_eq!(cmd.input_len, 12);
        let responder = std::thread::spawn(move || {
            cmd.buffer.lock()[..10].copy_from_slice(&[0x80, 0x01, 0, 0, 0, 0x0a, 0, 0, 0, 0]);
            cmd.completion.complete(0);
        });

        let polls = platform.poll_dispatcher();
        while read32(0x4c) != 0 {
            polls.wait().await;
            polls.run_pending();
        }
        responder.join().unwrap();

        assert_eq!(read32(0x44), 0);
        assert_eq!(read32(0x80), 0x0000_0180);
        assert_eq!(read32(0x84), 0x0000_0a00);

        // A memory overwrite request survives into the next boot.
        chipset.mmio_write(TPM_PPI_ADDR_BASE + 0x15a, &[1]);
        platform.reset();
        assert!(dev.ppi().unwrap().lock().memory_clear_requested());
    }
}
