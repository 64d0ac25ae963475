//! Virtual machine descriptor parsing.
//!
//! Two descriptor dialects are understood:
//!
//! - **OVF** (`<Envelope>`), either as a bare `.ovf` file or as the first `.ovf` member of an
//!   `.ova` tar archive. The member is unpacked into a scratch directory that is removed when
//!   analysis returns, whichever way it returns.
//! - **VirtualBox** machine files (`<VirtualBox>`), as `.vbox`.
//!
//! Element and attribute names are matched on their local part, so `ovf:`, `rasd:` and
//! `vmw:` prefixes make no difference. If the XML cannot be parsed, the raw text is sniffed
//! for the hypervisor that wrote it and the parse error is reported as `analysis_error`.

use super::{error_metadata, AnalysisError, MetadataExtractor, TypeMetadata};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::json;
use std::fs::{self, File};
use std::path::Path;

/// Largest descriptor read into memory.
const MAX_DESCRIPTOR_BYTES: u64 = 16 * 1024 * 1024;

/// CIM resource types used in OVF hardware sections.
const RESOURCE_PROCESSOR: u32 = 3;
const RESOURCE_MEMORY: u32 = 4;
const RESOURCE_NETWORK: u32 = 10;
const RESOURCE_DISK: u32 = 17;

const MIB: u128 = 1024 * 1024;

const DISK_EXTENSIONS: &[&str] = &[".vmdk", ".vdi", ".vhd", ".vhdx", ".qcow2", ".img"];

/// Extracts VM name, guest OS and hardware summary from VM descriptors and archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtualMachineExtractor;

impl MetadataExtractor for VirtualMachineExtractor {
    fn id(&self) -> &'static str {
        "virtual_machine"
    }

    fn extract(&self, path: &Path, extension: &str) -> Result<TypeMetadata, AnalysisError> {
        match extension {
            ".ova" => analyze_ova(path),
            ".ovf" => Ok(describe(&read_descriptor(path)?, "ovf")),
            ".vbox" => Ok(describe(&read_descriptor(path)?, "vbox")),
            other => Err(AnalysisError::Unrecognised {
                kind: "virtual machine",
                reason: format!("no parser for {other}"),
            }),
        }
    }
}

fn read_descriptor(path: &Path) -> Result<Vec<u8>, AnalysisError> {
    let len = fs::metadata(path)?.len();
    if len > MAX_DESCRIPTOR_BYTES {
        return Err(AnalysisError::Descriptor(format!(
            "descriptor is {len} bytes, larger than {MAX_DESCRIPTOR_BYTES}"
        )));
    }
    Ok(fs::read(path)?)
}

fn analyze_ova(path: &Path) -> Result<TypeMetadata, AnalysisError> {
    let mut archive = tar::Archive::new(File::open(path)?);
    let scratch = tempfile::TempDir::new()?;

    let mut embedded_files = 0usize;
    let mut embedded_disks = Vec::new();
    let mut descriptor: Option<(String, Vec<u8>)> = None;

    for entry in archive.entries_with_seek()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        embedded_files += 1;

        let member = entry.path()?.to_string_lossy().into_owned();
        let lower = member.to_ascii_lowercase();

        if descriptor.is_none() && lower.ends_with(".ovf") {
            if entry.size() > MAX_DESCRIPTOR_BYTES {
                return Err(AnalysisError::Descriptor(format!(
                    "embedded descriptor {member} is too large"
                )));
            }
            let target = scratch.path().join("descriptor.ovf");
            entry.unpack(&target)?;
            descriptor = Some((member, fs::read(&target)?));
        } else if DISK_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            embedded_disks.push(member);
        }
    }

    let mut metadata = match &descriptor {
        Some((_, bytes)) => describe(bytes, "ova"),
        None => {
            let mut m = error_metadata("archive contains no .ovf descriptor");
            m.insert("format".into(), json!("ova"));
            m
        }
    };

    if let Some((member, _)) = descriptor {
        metadata.insert("descriptor".into(), json!(member));
    }
    metadata.insert("embedded_files".into(), json!(embedded_files));
    metadata.insert("embedded_disks".into(), json!(embedded_disks));
    Ok(metadata)
}

/// Builds metadata from descriptor bytes, falling back to hypervisor sniffing on parse failure.
fn describe(bytes: &[u8], format: &str) -> TypeMetadata {
    let text = String::from_utf8_lossy(bytes);
    let hypervisor = sniff_hypervisor(&text);

    let mut metadata = match parse_descriptor(bytes) {
        Ok(descriptor) => descriptor.into_metadata(),
        Err(e) => error_metadata(&e.to_string()),
    };

    metadata.insert("format".into(), json!(format));
    if let Some(hypervisor) = hypervisor {
        metadata.insert("hypervisor".into(), json!(hypervisor));
    }
    metadata
}

/// Names the hypervisor that most likely wrote a descriptor.
fn sniff_hypervisor(text: &str) -> Option<&'static str> {
    let lower = text.to_ascii_lowercase();
    if lower.contains("virtualbox") || lower.contains("vbox:") {
        Some("virtualbox")
    } else if lower.contains("vmware") || lower.contains("vmw:") {
        Some("vmware")
    } else if lower.contains("hyper-v") || lower.contains("microsoft") {
        Some("hyper-v")
    } else if lower.contains("qemu") || lower.contains("libvirt") || lower.contains("kvm") {
        Some("qemu-kvm")
    } else if lower.contains("xen") {
        Some("xen")
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Ovf,
    VirtualBox,
}

#[derive(Debug, Default)]
struct HardwareItem {
    resource_type: Option<u32>,
    quantity: Option<u64>,
    units: Option<String>,
}

#[derive(Debug, Default)]
struct Descriptor {
    system_id: Option<String>,
    name: Option<String>,
    os_type: Option<String>,
    os_id: Option<String>,
    os_description: Option<String>,
    memory_mb: Option<u64>,
    cpu_count: Option<u64>,
    disk_items: usize,
    network_items: usize,
    disks_declared: usize,
    networks_declared: usize,
}

impl Descriptor {
    fn into_metadata(self) -> TypeMetadata {
        let mut metadata = TypeMetadata::new();

        if let Some(name) = self.name.or(self.system_id) {
            metadata.insert("vm_name".into(), json!(name));
        }
        let os = self
            .os_type
            .clone()
            .or_else(|| self.os_description.clone())
            .or_else(|| self.os_id.clone());
        if let Some(os) = os {
            metadata.insert("os_type".into(), json!(os));
        }
        if let Some(description) = self.os_description {
            metadata.insert("os_description".into(), json!(description));
        }
        if let Some(memory) = self.memory_mb {
            metadata.insert("memory_mb".into(), json!(memory));
        }
        if let Some(cpus) = self.cpu_count {
            metadata.insert("cpu_count".into(), json!(cpus));
        }

        let disks = if self.disk_items > 0 {
            self.disk_items
        } else {
            self.disks_declared
        };
        let networks = if self.network_items > 0 {
            self.network_items
        } else {
            self.networks_declared
        };
        metadata.insert("disk_count".into(), json!(disks));
        metadata.insert("network_count".into(), json!(networks));
        metadata
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, wanted: &str) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        if attr.key.local_name().as_ref() == wanted.as_bytes() {
            attr.unescape_value().ok().map(|v| v.trim().to_string())
        } else {
            None
        }
    })
}

fn xml_error(e: quick_xml::Error) -> AnalysisError {
    AnalysisError::Descriptor(format!("XML error: {e}"))
}

fn is_hardware_item(name: &str) -> bool {
    matches!(name, "Item" | "StorageItem" | "EthernetPortItem")
}

fn parse_descriptor(bytes: &[u8]) -> Result<Descriptor, AnalysisError> {
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut parser = DescriptorParser::default();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => parser.open(e, true)?,
            Ok(Event::Empty(ref e)) => parser.open(e, false)?,
            Ok(Event::Text(ref t)) => {
                let text = t.unescape().map_err(xml_error)?;
                parser.text(text.trim());
            }
            Ok(Event::End(ref e)) => parser.close(e.local_name().as_ref()),
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    parser.finish()
}

/// Tracks the open-element path while walking a descriptor.
#[derive(Debug, Default)]
struct DescriptorParser {
    stack: Vec<String>,
    dialect: Option<Dialect>,
    item: Option<HardwareItem>,
    descriptor: Descriptor,
}

impl DescriptorParser {
    fn open(&mut self, e: &BytesStart<'_>, has_children: bool) -> Result<(), AnalysisError> {
        let name = local_name(e);

        let dialect = match self.dialect {
            Some(d) => d,
            None => {
                let d = match name.as_str() {
                    "Envelope" => Dialect::Ovf,
                    "VirtualBox" => Dialect::VirtualBox,
                    other => {
                        return Err(AnalysisError::Descriptor(format!(
                            "unknown root element <{other}>"
                        )))
                    }
                };
                self.dialect = Some(d);
                d
            }
        };

        let parent = self.stack.last().map(String::as_str);
        match dialect {
            Dialect::Ovf => on_ovf_element(e, &name, parent, &mut self.descriptor),
            Dialect::VirtualBox => on_vbox_element(e, &name, &mut self.descriptor),
        }

        if has_children {
            if is_hardware_item(&name) {
                self.item = Some(HardwareItem::default());
            }
            self.stack.push(name);
        }
        Ok(())
    }

    fn text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }

        let current = self.stack.last().map(String::as_str);
        let parent = self
            .stack
            .len()
            .checked_sub(2)
            .and_then(|i| self.stack.get(i))
            .map(String::as_str);

        match (current, parent) {
            (Some("Name"), Some("VirtualSystem")) => {
                self.descriptor.name = Some(text.to_string());
            }
            (Some("Description"), Some("OperatingSystemSection")) => {
                self.descriptor.os_description = Some(text.to_string());
            }
            (Some(field), _) => {
                if let Some(item) = self.item.as_mut() {
                    match field {
                        "ResourceType" => item.resource_type = text.parse().ok(),
                        "VirtualQuantity" => item.quantity = text.parse().ok(),
                        "AllocationUnits" => item.units = Some(text.to_string()),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    fn close(&mut self, name: &[u8]) {
        if is_hardware_item(&String::from_utf8_lossy(name)) {
            if let Some(finished) = self.item.take() {
                apply_item(finished, &mut self.descriptor);
            }
        }
        self.stack.pop();
    }

    fn finish(self) -> Result<Descriptor, AnalysisError> {
        if self.dialect.is_none() {
            return Err(AnalysisError::Descriptor("document has no root element".into()));
        }
        Ok(self.descriptor)
    }
}

fn on_ovf_element(e: &BytesStart<'_>, name: &str, parent: Option<&str>, d: &mut Descriptor) {
    match (name, parent) {
        ("VirtualSystem", _) => {
            if d.system_id.is_none() {
                d.system_id = attribute(e, "id");
            }
        }
        ("OperatingSystemSection", _) => {
            d.os_type = attribute(e, "osType").or(d.os_type.take());
            d.os_id = attribute(e, "id").or(d.os_id.take());
        }
        ("Disk", Some("DiskSection")) => d.disks_declared += 1,
        ("Network", Some("NetworkSection")) => d.networks_declared += 1,
        _ => {}
    }
}

fn on_vbox_element(e: &BytesStart<'_>, name: &str, d: &mut Descriptor) {
    match name {
        "Machine" => {
            d.name = attribute(e, "name");
            d.os_type = attribute(e, "OSType");
        }
        "Memory" => d.memory_mb = attribute(e, "RAMSize").and_then(|v| v.parse().ok()),
        "CPU" => {
            d.cpu_count = Some(attribute(e, "count").and_then(|v| v.parse().ok()).unwrap_or(1));
        }
        "Adapter" => {
            if attribute(e, "enabled").as_deref() == Some("true") {
                d.network_items += 1;
            }
        }
        "AttachedDevice" => {
            if attribute(e, "type").as_deref() == Some("HardDisk") {
                d.disk_items += 1;
            }
        }
        "HardDisk" => d.disks_declared += 1,
        _ => {}
    }
}

fn apply_item(item: HardwareItem, d: &mut Descriptor) {
    match item.resource_type {
        Some(RESOURCE_PROCESSOR) => d.cpu_count = item.quantity.or(d.cpu_count),
        Some(RESOURCE_MEMORY) => {
            if let Some(quantity) = item.quantity {
                d.memory_mb = Some(memory_in_mb(quantity, item.units.as_deref()));
            }
        }
        Some(RESOURCE_NETWORK) => d.network_items += 1,
        Some(RESOURCE_DISK) => d.disk_items += 1,
        _ => {}
    }
}

/// Converts an OVF memory quantity to MiB.
///
/// Units follow the DMTF programmatic form (`byte * 2^20`) or a plain unit name; a missing or
/// unreadable unit is taken as MiB.
fn memory_in_mb(quantity: u64, units: Option<&str>) -> u64 {
    let multiplier = units.and_then(unit_multiplier).unwrap_or(MIB);
    let bytes = quantity as u128 * multiplier;
    u64::try_from(bytes / MIB).unwrap_or(u64::MAX)
}

fn unit_multiplier(units: &str) -> Option<u128> {
    let compact: String = units
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();

    if let Some(rest) = compact.strip_prefix("byte") {
        let rest = rest.strip_prefix('s').unwrap_or(rest);
        if rest.is_empty() {
            return Some(1);
        }
        let expr = rest.strip_prefix('*')?;
        return match expr.split_once('^') {
            Some((base, exp)) => {
                let base: u128 = base.parse().ok()?;
                let exp: u32 = exp.parse().ok()?;
                base.checked_pow(exp)
            }
            None => expr.parse().ok(),
        };
    }

    match compact.as_str() {
        "kb" | "kib" | "kilobyte" | "kilobytes" => Some(1024),
        "mb" | "mib" | "megabyte" | "megabytes" => Some(MIB),
        "gb" | "gib" | "gigabyte" | "gigabytes" => Some(1024 * MIB),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ANALYSIS_ERROR_KEY;
    use tempfile::TempDir;

    fn is_fallback(metadata: &TypeMetadata) -> bool {
        metadata.contains_key(ANALYSIS_ERROR_KEY)
    }

    const VMWARE_OVF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1"
          xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData"
          xmlns:vmw="http://www.vmware.com/schema/ovf">
  <References>
    <File ovf:href="web-disk1.vmdk" ovf:id="file1"/>
  </References>
  <DiskSection>
    <Info>Virtual disk information</Info>
    <Disk ovf:capacity="20" ovf:diskId="vmdisk1" ovf:fileRef="file1"/>
    <Disk ovf:capacity="40" ovf:diskId="vmdisk2"/>
  </DiskSection>
  <NetworkSection>
    <Info>The list of logical networks</Info>
    <Network ovf:name="VM Network"/>
  </NetworkSection>
  <VirtualSystem ovf:id="web-01">
    <Info>A virtual machine</Info>
    <Name>Web Server 01</Name>
    <OperatingSystemSection ovf:id="94" vmw:osType="ubuntu64Guest">
      <Info>The kind of installed guest operating system</Info>
      <Description>Ubuntu Linux (64-bit)</Description>
    </OperatingSystemSection>
    <VirtualHardwareSection>
      <Item>
        <rasd:AllocationUnits>hertz * 10^6</rasd:AllocationUnits>
        <rasd:ResourceType>3</rasd:ResourceType>
        <rasd:VirtualQuantity>2</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:AllocationUnits>byte * 2^20</rasd:AllocationUnits>
        <rasd:ResourceType>4</rasd:ResourceType>
        <rasd:VirtualQuantity>4096</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:ResourceType>17</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:ResourceType>17</rasd:ResourceType>
      </Item>
      <EthernetPortItem>
        <rasd:ResourceType>10</rasd:ResourceType>
      </EthernetPortItem>
    </VirtualHardwareSection>
  </VirtualSystem>
</Envelope>"#;

    const VBOX: &str = r#"<?xml version="1.0"?>
<VirtualBox xmlns="http://www.virtualbox.org/" version="1.19-linux">
  <Machine uuid="{a1b2}" name="Dev Box" OSType="Debian_64">
    <MediaRegistry>
      <HardDisks>
        <HardDisk uuid="{d1}" location="Dev Box.vdi" format="VDI"/>
      </HardDisks>
    </MediaRegistry>
    <Hardware>
      <CPU count="4"/>
      <Memory RAMSize="8192"/>
      <Network>
        <Adapter slot="0" enabled="true" type="82540EM"/>
        <Adapter slot="1" enabled="false"/>
        <Adapter slot="2" enabled="true"/>
      </Network>
    </Hardware>
    <StorageControllers>
      <StorageController name="SATA" type="AHCI">
        <AttachedDevice type="HardDisk" port="0" device="0"><Image uuid="{d1}"/></AttachedDevice>
        <AttachedDevice type="DVD" port="1" device="0"/>
      </StorageController>
    </StorageControllers>
  </Machine>
</VirtualBox>"#;

    fn write(temp: &TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = temp.path().join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_ovf_envelope() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "web.ovf", VMWARE_OVF.as_bytes());

        let m = VirtualMachineExtractor.extract(&path, ".ovf").unwrap();

        assert!(!is_fallback(&m));
        assert_eq!(m["format"], "ovf");
        assert_eq!(m["vm_name"], "Web Server 01");
        assert_eq!(m["os_type"], "ubuntu64Guest");
        assert_eq!(m["os_description"], "Ubuntu Linux (64-bit)");
        assert_eq!(m["memory_mb"], 4096);
        assert_eq!(m["cpu_count"], 2);
        assert_eq!(m["disk_count"], 2);
        assert_eq!(m["network_count"], 1);
        assert_eq!(m["hypervisor"], "vmware");
    }

    #[test]
    fn test_ovf_falls_back_to_declared_sections() {
        let xml = r#"<ovf:Envelope xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1">
            <ovf:DiskSection><ovf:Disk/><ovf:Disk/><ovf:Disk/></ovf:DiskSection>
            <ovf:NetworkSection><ovf:Network/></ovf:NetworkSection>
            <ovf:VirtualSystem ovf:id="minimal"/>
        </ovf:Envelope>"#;

        let d = parse_descriptor(xml.as_bytes()).unwrap();
        let m = d.into_metadata();

        assert_eq!(m["vm_name"], "minimal");
        assert_eq!(m["disk_count"], 3);
        assert_eq!(m["network_count"], 1);
        assert!(m.get("memory_mb").is_none());
    }

    #[test]
    fn test_vbox_machine() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "dev.vbox", VBOX.as_bytes());

        let m = VirtualMachineExtractor.extract(&path, ".vbox").unwrap();

        assert_eq!(m["format"], "vbox");
        assert_eq!(m["vm_name"], "Dev Box");
        assert_eq!(m["os_type"], "Debian_64");
        assert_eq!(m["memory_mb"], 8192);
        assert_eq!(m["cpu_count"], 4);
        assert_eq!(m["disk_count"], 1);
        assert_eq!(m["network_count"], 2);
        assert_eq!(m["hypervisor"], "virtualbox");
    }

    #[test]
    fn test_malformed_xml_sniffs_hypervisor() {
        let temp = TempDir::new().unwrap();
        let path = write(
            &temp,
            "broken.ovf",
            b"<Envelope><VirtualSystem><Name>VMware export</Oops></Envelope>",
        );

        let m = VirtualMachineExtractor.extract(&path, ".ovf").unwrap();

        assert!(is_fallback(&m));
        assert_eq!(m["hypervisor"], "vmware");
        assert_eq!(m["format"], "ovf");
    }

    #[test]
    fn test_unknown_root_is_reported() {
        let m = describe(b"<domain type='kvm'><name>guest</name></domain>", "ovf");

        assert!(is_fallback(&m));
        assert_eq!(m["hypervisor"], "qemu-kvm");
    }

    #[test]
    fn test_allocation_units() {
        assert_eq!(memory_in_mb(2048, Some("byte * 2^20")), 2048);
        assert_eq!(memory_in_mb(2, Some("byte * 2^30")), 2048);
        assert_eq!(memory_in_mb(1_048_576, Some("KiloBytes")), 1024);
        assert_eq!(memory_in_mb(4, Some("GB")), 4096);
        assert_eq!(memory_in_mb(512, None), 512);
        assert_eq!(memory_in_mb(512, Some("furlongs")), 512);
        assert_eq!(memory_in_mb(1024 * 1024 * 3, Some("bytes")), 3);
    }

    fn build_ova(temp: &TempDir, members: &[(&str, &[u8])]) -> std::path::PathBuf {
        let path = temp.path().join("appliance.ova");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        for (name, data) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.finish().unwrap();
        path
    }

    #[test]
    fn test_ova_archive() {
        let temp = TempDir::new().unwrap();
        let path = build_ova(
            &temp,
            &[
                ("web.ovf", VMWARE_OVF.as_bytes()),
                ("web.mf", b"SHA256(web.ovf)= 00"),
                ("web-disk1.vmdk", b"KDMV fake disk"),
            ],
        );

        let m = VirtualMachineExtractor.extract(&path, ".ova").unwrap();

        assert_eq!(m["format"], "ova");
        assert_eq!(m["descriptor"], "web.ovf");
        assert_eq!(m["embedded_files"], 3);
        assert_eq!(m["embedded_disks"][0], "web-disk1.vmdk");
        assert_eq!(m["vm_name"], "Web Server 01");
        assert_eq!(m["memory_mb"], 4096);
    }

    #[test]
    fn test_ova_without_descriptor() {
        let temp = TempDir::new().unwrap();
        let path = build_ova(&temp, &[("disk.vmdk", b"data")]);

        let m = VirtualMachineExtractor.extract(&path, ".ova").unwrap();

        assert!(is_fallback(&m));
        assert_eq!(m["embedded_files"], 1);
    }

    #[test]
    fn test_ova_that_is_not_a_tar() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "junk.ova", &[0xFFu8; 1024]);

        assert!(VirtualMachineExtractor.extract(&path, ".ova").is_err());
    }
}
