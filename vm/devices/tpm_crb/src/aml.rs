// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DSDT description of the TPM CRB device.

use crate::TPM_CRB_ADDR_BASE;
use crate::TPM_CRB_ADDR_SIZE;
use crate::TpmCrb;
use crate::backend::TpmVersion;
use crate::crb::CrbCore;
use crate::ppi::PpiBuilder;
use acpi::dsdt::CurrentResourceSettings;
use acpi::dsdt::Device;
use acpi::dsdt::EisaId;
use acpi::dsdt::Memory32Fixed;
use acpi::dsdt::NamedInteger;
use acpi::dsdt::NamedObject;
use acpi::dsdt::NamedString;
use acpi::dsdt::Scope;

const TPM_CRB_UID: u64 = 1;
/// Present, enabled, shown in the UI and functioning.
const TPM_STA_PRESENT: u64 = 0xf;

impl<C: CrbCore, P: PpiBuilder> TpmCrb<C, P> {
    /// Appends the `TPM` device node to `scope`.
    pub fn build_dev_aml(&self, scope: &mut Scope) {
        let mut dev = Device::new(b"TPM");
        if self.version() == TpmVersion::V2_0 {
            dev.add_object(&NamedString::new(b"_HID", b"MSFT0101"));
            dev.add_object(&NamedString::new(b"_STR", b"TPM 2.0 Device"));
        } else {
            dev.add_object(&NamedObject::new(b"_HID", &EisaId(*b"PNP0C31")));
        }
        dev.add_object(&NamedInteger::new(b"_UID", TPM_CRB_UID));
        dev.add_object(&NamedInteger::new(b"_STA", TPM_STA_PRESENT));

        let mut crs = CurrentResourceSettings::new();
        crs.add_resource(&Memory32Fixed::new(
            TPM_CRB_ADDR_BASE as u32,
            TPM_CRB_ADDR_SIZE as u32,
            true,
        ));
        dev.add_object(&crs);

        if let Some(ppi) = &self.ppi {
            ppi.lock().build_firmware_fragment(&mut dev);
        }
        scope.add_object(&dev);
    }
}
