//! Libvirt domain definitions for placements.
//!
//! A [`DomainDefinition`] is the typed shape of a guest; [`render`] turns it
//! into the domain XML handed to `virsh define`. Definitions are built from
//! placement requests, so everything in here is deterministic except the
//! per-boot domain UUID supplied by the caller.
//!
//! [`render`]: DomainDefinition::render

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use uuid::Uuid;

use crate::records::DesiredPlacement;

/// Locally administered MAC prefix used for all guest interfaces.
const MAC_PREFIX: &str = "00:50:03";

/// Typed libvirt domain definition.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainDefinition {
    /// Domain name, unique per host.
    pub name: String,

    /// Domain UUID, unique per boot.
    pub uuid: Uuid,

    /// Guest RAM in KiB.
    pub memory_kib: u64,

    /// Guest vCPU count.
    pub vcpus: u32,

    /// RBD volume backing the boot disk, as `pool/name`.
    pub volume: String,

    /// Guest interface MAC address.
    pub mac_address: String,
}

/// Build a domain definition for a placement.
pub fn build_definition(
    placement_id: &str,
    placement: &DesiredPlacement,
    uuid: Uuid,
    volume: &str,
) -> DomainDefinition {
    DomainDefinition {
        name: instance_name(placement_id, &placement.name),
        uuid,
        memory_kib: placement.resources.ram_mib * 1024,
        vcpus: placement.resources.vcpus,
        volume: volume.to_string(),
        mac_address: mac_address(placement_id),
    }
}

/// Derive a libvirt-safe domain name from a placement.
///
/// The placement id is prefixed onto the requested name, so two placements
/// requesting the same name still get distinct domains on a host that runs
/// both. Libvirt rejects names with shell-hostile characters, and operators
/// type these names into `virsh`, so anything outside `[A-Za-z0-9._-]` is
/// replaced. An empty requested name falls back to `vm-{placement_id}`.
pub fn instance_name(placement_id: &str, requested: &str) -> String {
    let base = if requested.trim().is_empty() {
        format!("vm-{placement_id}")
    } else {
        format!("{placement_id}-{}", requested.trim())
    };

    base.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Derive a stable MAC address for a placement under the platform prefix.
///
/// The same placement gets the same MAC on whichever host ends up running
/// it, so DHCP reservations survive a claim moving between hosts.
fn mac_address(placement_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    placement_id.hash(&mut hasher);
    let digest = hasher.finish();

    format!(
        "{MAC_PREFIX}:{:02x}:{:02x}:{:02x}",
        (digest >> 16) as u8,
        (digest >> 8) as u8,
        digest as u8,
    )
}

impl DomainDefinition {
    /// Render the libvirt domain XML for this definition.
    pub fn render(&self) -> String {
        format!(
            r#"<domain type='kvm'>
  <name>{name}</name>
  <uuid>{uuid}</uuid>
  <memory unit='KiB'>{memory}</memory>
  <currentMemory unit='KiB'>{memory}</currentMemory>
  <vcpu placement='static'>{vcpus}</vcpu>
  <os>
    <type arch='x86_64' machine='pc'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
    <pae/>
  </features>
  <clock offset='utc'/>
  <on_poweroff>destroy</on_poweroff>
  <on_reboot>restart</on_reboot>
  <on_crash>destroy</on_crash>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='network' device='disk'>
      <driver name='qemu' type='raw' cache='writeback'/>
      <auth username='admin'>
        <secret type='ceph' usage='ceph'/>
      </auth>
      <source protocol='rbd' name='{volume}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <interface type='bridge'>
      <source bridge='br0'/>
      <mac address='{mac}'/>
      <model type='virtio'/>
    </interface>
    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
    <memballoon model='virtio'/>
  </devices>
</domain>
"#,
            name = self.name,
            uuid = self.uuid,
            memory = self.memory_kib,
            vcpus = self.vcpus,
            volume = self.volume,
            mac = self.mac_address,
        )
    }
}
