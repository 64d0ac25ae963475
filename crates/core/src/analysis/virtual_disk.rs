//! Virtual disk identification.
//!
//! The format name and the hypervisors able to attach it follow from the extension alone. The
//! header is then checked for the format's signature and, where the header records it, the
//! virtual (guest-visible) size. A header too short to hold a field only omits that field;
//! `analysis_error` is reserved for files that cannot be read at all.

use super::{read_region, u32_be, u32_le, u64_be, u64_le, AnalysisError, MetadataExtractor, TypeMetadata};
use crate::constants::ANALYSIS_ERROR_KEY;
use serde_json::json;
use std::fs::File;
use std::path::Path;

const SECTOR: u64 = 512;
const VDI_SIGNATURE: u32 = 0xBEDA_107F;

struct DiskFormat {
    extension: &'static str,
    name: &'static str,
    hypervisors: &'static [&'static str],
}

const FORMATS: &[DiskFormat] = &[
    DiskFormat {
        extension: ".vmdk",
        name: "VMDK",
        hypervisors: &["VMware Workstation", "VMware ESXi", "VirtualBox", "QEMU/KVM"],
    },
    DiskFormat {
        extension: ".vdi",
        name: "VDI",
        hypervisors: &["VirtualBox", "QEMU/KVM"],
    },
    DiskFormat {
        extension: ".vhd",
        name: "VHD",
        hypervisors: &["Hyper-V", "VirtualBox", "QEMU/KVM", "Xen"],
    },
    DiskFormat {
        extension: ".vhdx",
        name: "VHDX",
        hypervisors: &["Hyper-V", "QEMU/KVM"],
    },
    DiskFormat {
        extension: ".qcow2",
        name: "QCOW2",
        hypervisors: &["QEMU/KVM", "Proxmox VE", "libvirt"],
    },
];

/// Reports format, compatible hypervisors and header facts for virtual disks.
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtualDiskExtractor;

impl MetadataExtractor for VirtualDiskExtractor {
    fn id(&self) -> &'static str {
        "virtual_disk"
    }

    fn extract(&self, path: &Path, extension: &str) -> Result<TypeMetadata, AnalysisError> {
        let format = FORMATS
            .iter()
            .find(|f| f.extension == extension)
            .ok_or_else(|| AnalysisError::Unrecognised {
                kind: "virtual disk",
                reason: format!("no format known for {extension}"),
            })?;

        let mut metadata = TypeMetadata::new();
        metadata.insert("format".into(), json!(format.name));
        metadata.insert("compatible_hypervisors".into(), json!(format.hypervisors));

        match inspect_header(path, extension) {
            Ok(header) => {
                metadata.insert("signature_valid".into(), json!(header.signature_valid));
                if let Some(size) = header.virtual_size_bytes {
                    metadata.insert("virtual_size_bytes".into(), json!(size));
                }
                if let Some(allocation) = header.allocation {
                    metadata.insert("allocation".into(), json!(allocation));
                }
                if let Some(version) = header.version {
                    metadata.insert("format_version".into(), json!(version));
                }
            }
            Err(e) => {
                metadata.insert(ANALYSIS_ERROR_KEY.into(), json!(e.to_string()));
            }
        }
        Ok(metadata)
    }
}

#[derive(Debug, Default)]
struct HeaderFacts {
    signature_valid: bool,
    virtual_size_bytes: Option<u64>,
    allocation: Option<&'static str>,
    version: Option<u32>,
}

fn inspect_header(path: &Path, extension: &str) -> Result<HeaderFacts, AnalysisError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let head = read_region(&mut file, 0, 1024)?;
    let mut facts = HeaderFacts::default();

    match extension {
        ".vmdk" => {
            if head.starts_with(b"KDMV") {
                facts.signature_valid = true;
                facts.allocation = Some("sparse");
                facts.version = u32_le(&head, 4);
                facts.virtual_size_bytes = u64_le(&head, 12).map(|s| s.saturating_mul(SECTOR));
            } else if head.starts_with(b"# Disk DescriptorFile") {
                facts.signature_valid = true;
                facts.allocation = Some("descriptor");
            }
        }
        ".vdi" => {
            if u32_le(&head, 0x40) == Some(VDI_SIGNATURE) {
                facts.signature_valid = true;
                facts.allocation = match u32_le(&head, 0x4C) {
                    Some(1) => Some("dynamic"),
                    Some(2) => Some("fixed"),
                    Some(4) => Some("differencing"),
                    _ => None,
                };
                facts.virtual_size_bytes = u64_le(&head, 0x170);
            }
        }
        ".vhd" => {
            let footer = if len >= SECTOR {
                read_region(&mut file, len - SECTOR, SECTOR as usize)?
            } else {
                Vec::new()
            };
            let footer = if footer.starts_with(b"conectix") {
                Some(footer)
            } else if head.starts_with(b"conectix") {
                Some(head.clone())
            } else {
                None
            };
            if let Some(footer) = footer {
                facts.signature_valid = true;
                facts.virtual_size_bytes = u64_be(&footer, 48);
                facts.allocation = match u32_be(&footer, 60) {
                    Some(2) => Some("fixed"),
                    Some(3) => Some("dynamic"),
                    Some(4) => Some("differencing"),
                    _ => None,
                };
            }
        }
        ".vhdx" => {
            facts.signature_valid = head.starts_with(b"vhdxfile");
        }
        ".qcow2" => {
            if head.starts_with(b"QFI\xfb") {
                facts.signature_valid = true;
                facts.version = u32_be(&head, 4);
                facts.virtual_size_bytes = u64_be(&head, 24);
            }
        }
        _ => {}
    }

    Ok(facts)
}
