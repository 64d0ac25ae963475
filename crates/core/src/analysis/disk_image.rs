//! Disk image header parsing.
//!
//! Everything here reads a handful of fixed offsets; no image is ever mounted or decompressed.
//!
//! | Extension | Probed structures |
//! |---|---|
//! | `.iso` | ISO 9660 volume descriptors from sector 16, El Torito, Joliet, UDF, hybrid MBR |
//! | `.img` | ISO 9660 (raw CD dumps), MBR or GPT partition table, bare filesystem superblock |
//! | `.dmg` | UDIF `koly` trailer, otherwise a bare HFS+/APFS volume |

use super::{
    ascii_field, read_region, u16_le, u32_be, u32_le, u64_be, u64_le, AnalysisError,
    MetadataExtractor, TypeMetadata,
};
use memchr::memmem;
use serde_json::{json, Value};
use std::fs::File;
use std::path::Path;

const ISO_SECTOR: u64 = 2048;
const ISO_FIRST_DESCRIPTOR: u64 = 16;
const ISO_MAX_DESCRIPTORS: u64 = 32;

const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_TABLE_OFFSET: usize = 446;
const LBA_SIZE: u64 = 512;
const GPT_MAX_ENTRIES: u32 = 128;
const GPT_MIN_ENTRY_SIZE: u32 = 128;
const GPT_MAX_ENTRY_SIZE: u32 = 4096;

const UDIF_TRAILER_LEN: u64 = 512;
const UDIF_MAX_PLIST_BYTES: u64 = 4 * 1024 * 1024;

const EXT_SUPERBLOCK_OFFSET: u64 = 1024;
const EXT_MAGIC: u16 = 0xEF53;
const EXT_COMPAT_HAS_JOURNAL: u32 = 0x0004;
const EXT_INCOMPAT_EXTENTS: u32 = 0x0040;
const EXT_INCOMPAT_64BIT: u32 = 0x0080;

/// Hints matched against upper-cased volume and system identifiers, in priority order.
///
/// Apple hints precede the Windows `WIN` hint so `DARWIN` resolves to macOS.
const OS_HINTS: &[(&str, &str)] = &[
    ("MACOS", "macos"),
    ("MAC OS", "macos"),
    ("OS X", "macos"),
    ("OSX", "macos"),
    ("DARWIN", "macos"),
    ("APPLE", "macos"),
    ("UBUNTU", "linux"),
    ("DEBIAN", "linux"),
    ("FEDORA", "linux"),
    ("CENTOS", "linux"),
    ("RHEL", "linux"),
    ("ROCKY", "linux"),
    ("ALMALINUX", "linux"),
    ("ARCH_", "linux"),
    ("ARCHLINUX", "linux"),
    ("MINT", "linux"),
    ("KALI", "linux"),
    ("OPENSUSE", "linux"),
    ("ALPINE", "linux"),
    ("MANJARO", "linux"),
    ("LINUX", "linux"),
    ("FREEBSD", "bsd"),
    ("OPENBSD", "bsd"),
    ("NETBSD", "bsd"),
    ("CCCOMA", "windows"),
    ("CCSA", "windows"),
    ("CPBA", "windows"),
    ("CENA", "windows"),
    ("SSS_X", "windows"),
    ("GRMC", "windows"),
    ("WIN", "windows"),
];

/// Extracts partition, filesystem and boot information from disk images.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskImageExtractor;

impl MetadataExtractor for DiskImageExtractor {
    fn id(&self) -> &'static str {
        "disk_image"
    }

    fn extract(&self, path: &Path, extension: &str) -> Result<TypeMetadata, AnalysisError> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();

        match extension {
            ".iso" => {
                let iso = probe_iso(&mut file, 0)?.ok_or_else(|| AnalysisError::Unrecognised {
                    kind: "disk image",
                    reason: "no ISO 9660 or UDF volume descriptors".into(),
                })?;
                iso.into_metadata(&mut file)
            }
            ".img" => analyze_raw_image(&mut file),
            ".dmg" => analyze_dmg(&mut file, len),
            other => Err(AnalysisError::Unrecognised {
                kind: "disk image",
                reason: format!("no parser for {other}"),
            }),
        }
    }
}

/// Summary of an ISO 9660 / UDF volume.
#[derive(Debug, Default)]
struct IsoVolume {
    system_id: Option<String>,
    volume_id: Option<String>,
    volume_size_bytes: Option<u64>,
    iso9660: bool,
    el_torito: bool,
    joliet: bool,
    udf: bool,
}

impl IsoVolume {
    fn into_metadata(self, file: &mut File) -> Result<TypeMetadata, AnalysisError> {
        let boot_sector = read_region(file, 0, LBA_SIZE as usize)?;
        let hybrid = boot_sector.get(510..512) == Some(&MBR_SIGNATURE[..]);

        let filesystem = match (self.iso9660, self.udf) {
            (true, true) => "iso9660+udf",
            (false, true) => "udf",
            _ => "iso9660",
        };

        let mut metadata = TypeMetadata::new();
        metadata.insert("format".into(), json!("iso9660"));
        metadata.insert("filesystem".into(), json!(filesystem));
        metadata.insert("bootable".into(), json!(self.el_torito || hybrid));
        metadata.insert("el_torito".into(), json!(self.el_torito));
        metadata.insert("hybrid".into(), json!(hybrid));
        metadata.insert("joliet".into(), json!(self.joliet));
        metadata.insert("udf".into(), json!(self.udf));
        metadata.insert(
            "os_family".into(),
            json!(guess_os_family(self.volume_id.as_deref(), self.system_id.as_deref())),
        );
        if let Some(volume_id) = self.volume_id {
            metadata.insert("volume_id".into(), json!(volume_id));
        }
        if let Some(system_id) = self.system_id {
            metadata.insert("system_id".into(), json!(system_id));
        }
        if let Some(size) = self.volume_size_bytes {
            metadata.insert("volume_size_bytes".into(), json!(size));
        }
        Ok(metadata)
    }
}

/// Walks the volume descriptor set starting at sector 16 of a volume at `base`.
fn probe_iso(file: &mut File, base: u64) -> Result<Option<IsoVolume>, AnalysisError> {
    let mut volume = IsoVolume::default();
    let mut recognised = false;

    for index in 0..ISO_MAX_DESCRIPTORS {
        let offset = base + (ISO_FIRST_DESCRIPTOR + index) * ISO_SECTOR;
        let sector = read_region(file, offset, ISO_SECTOR as usize)?;
        if sector.len() < 7 {
            break;
        }

        match &sector[1..6] {
            b"CD001" => {
                recognised = true;
                volume.iso9660 = true;
                match sector[0] {
                    0 => {
                        if sector.get(7..30) == Some(&b"EL TORITO SPECIFICATION"[..]) {
                            volume.el_torito = true;
                        }
                    }
                    1 => {
                        volume.system_id = sector.get(8..40).and_then(ascii_field);
                        volume.volume_id = sector.get(40..72).and_then(ascii_field);
                        let blocks = u32_le(&sector, 80);
                        let block_size = u16_le(&sector, 128);
                        if let (Some(blocks), Some(block_size)) = (blocks, block_size) {
                            volume.volume_size_bytes = Some(blocks as u64 * block_size as u64);
                        }
                    }
                    2 => {
                        let escapes = sector.get(88..91).unwrap_or_default();
                        if matches!(escapes, b"%/@" | b"%/C" | b"%/E") {
                            volume.joliet = true;
                        }
                    }
                    _ => {}
                }
            }
            b"BEA01" | b"TEA01" => recognised = true,
            b"NSR02" | b"NSR03" => {
                recognised = true;
                volume.udf = true;
            }
            _ => break,
        }
    }

    Ok(recognised.then_some(volume))
}

fn guess_os_family(volume_id: Option<&str>, system_id: Option<&str>) -> &'static str {
    for candidate in [volume_id, system_id].into_iter().flatten() {
        let upper = candidate.to_ascii_uppercase();
        if let Some((_, family)) = OS_HINTS.iter().find(|(hint, _)| upper.contains(hint)) {
            return *family;
        }
    }
    "unknown"
}

fn analyze_raw_image(file: &mut File) -> Result<TypeMetadata, AnalysisError> {
    if let Some(iso) = probe_iso(file, 0)? {
        return iso.into_metadata(file);
    }

    let mut metadata = TypeMetadata::new();
    metadata.insert("format".into(), json!("raw"));

    let boot_sector = read_region(file, 0, LBA_SIZE as usize)?;
    let has_signature = boot_sector.get(510..512) == Some(&MBR_SIGNATURE[..]);

    // A boot sector that is itself a volume boot record means there is no partition table.
    if has_signature {
        if let Some(fs) = probe_filesystem(file, 0)? {
            metadata.insert("partition_table".into(), json!("none"));
            metadata.insert("bootable".into(), json!(false));
            fs.insert_into(&mut metadata);
            return Ok(metadata);
        }

        let mbr = parse_mbr(&boot_sector);
        if mbr.iter().any(|p| p.type_id == 0xEE) {
            let partitions = parse_gpt(file)?;
            let bootable = partitions.iter().any(|p| p.kind == "efi_system");
            return finish_partitioned(file, metadata, "gpt", bootable, partitions);
        }

        let bootable = mbr.iter().any(|p| p.active);
        let partitions = mbr
            .into_iter()
            .map(|p| Partition {
                index: p.index,
                kind: mbr_type_name(p.type_id).to_string(),
                start_lba: p.start_lba as u64,
                sectors: p.sectors as u64,
                bootable: p.active,
                name: None,
            })
            .collect();
        return finish_partitioned(file, metadata, "mbr", bootable, partitions);
    }

    match probe_filesystem(file, 0)? {
        Some(fs) => {
            metadata.insert("partition_table".into(), json!("none"));
            metadata.insert("bootable".into(), json!(false));
            fs.insert_into(&mut metadata);
            Ok(metadata)
        }
        None => Err(AnalysisError::Unrecognised {
            kind: "disk image",
            reason: "no partition table or filesystem signature".into(),
        }),
    }
}

#[derive(Debug)]
struct MbrEntry {
    index: usize,
    active: bool,
    type_id: u8,
    start_lba: u32,
    sectors: u32,
}

fn parse_mbr(boot_sector: &[u8]) -> Vec<MbrEntry> {
    (0..4)
        .filter_map(|index| {
            let at = MBR_TABLE_OFFSET + index * 16;
            let entry = boot_sector.get(at..at + 16)?;
            let type_id = entry[4];
            if type_id == 0 {
                return None;
            }
            Some(MbrEntry {
                index: index + 1,
                active: entry[0] == 0x80,
                type_id,
                start_lba: u32_le(entry, 8)?,
                sectors: u32_le(entry, 12)?,
            })
        })
        .collect()
}

fn mbr_type_name(type_id: u8) -> &'static str {
    match type_id {
        0x01 | 0x04 | 0x06 | 0x0E => "fat16",
        0x07 => "ntfs",
        0x0B | 0x0C => "fat32",
        0x0F | 0x05 => "extended",
        0x17 => "hidden_ntfs",
        0x27 => "windows_recovery",
        0x82 => "linux_swap",
        0x83 => "linux",
        0x8E => "linux_lvm",
        0xA5 => "freebsd",
        0xA6 => "openbsd",
        0xA8 => "apple_ufs",
        0xAF => "apple_hfs",
        0xEE => "gpt_protective",
        0xEF => "efi_system",
        0xFD => "linux_raid",
        _ => "other",
    }
}

#[derive(Debug)]
struct Partition {
    index: usize,
    kind: String,
    start_lba: u64,
    sectors: u64,
    bootable: bool,
    name: Option<String>,
}

fn parse_gpt(file: &mut File) -> Result<Vec<Partition>, AnalysisError> {
    let header = read_region(file, LBA_SIZE, LBA_SIZE as usize)?;
    if header.get(0..8) != Some(&b"EFI PART"[..]) {
        return Err(AnalysisError::Unrecognised {
            kind: "disk image",
            reason: "protective MBR without a GPT header".into(),
        });
    }

    let entries_lba = u64_le(&header, 72).unwrap_or(2);
    let count = u32_le(&header, 80).unwrap_or(0).min(GPT_MAX_ENTRIES);
    let entry_size = u32_le(&header, 84).unwrap_or(GPT_MIN_ENTRY_SIZE);
    if entry_size < GPT_MIN_ENTRY_SIZE
        || entry_size > GPT_MAX_ENTRY_SIZE
        || entry_size % GPT_MIN_ENTRY_SIZE != 0
    {
        return Err(AnalysisError::Unrecognised {
            kind: "disk image",
            reason: format!("GPT partition entry size {entry_size} is invalid"),
        });
    }
    let entry_size = entry_size as u64;

    let table = read_region(
        file,
        entries_lba.saturating_mul(LBA_SIZE),
        (count as u64 * entry_size) as usize,
    )?;

    let mut partitions = Vec::new();
    for index in 0..count as usize {
        let at = index * entry_size as usize;
        let Some(entry) = table.get(at..at + 128) else {
            break;
        };
        if entry[..16].iter().all(|b| *b == 0) {
            continue;
        }

        let type_guid = guid_to_string(&entry[..16]);
        let first = u64_le(entry, 32).unwrap_or(0);
        let last = u64_le(entry, 40).unwrap_or(first);
        let kind = gpt_type_name(&type_guid);

        partitions.push(Partition {
            index: index + 1,
            kind: kind.map(str::to_string).unwrap_or(type_guid),
            start_lba: first,
            sectors: last.saturating_sub(first) + 1,
            bootable: kind == Some("efi_system"),
            name: utf16_name(&entry[56..128]),
        });
    }
    Ok(partitions)
}

/// Formats a mixed-endian on-disk GUID in its canonical upper-case form.
fn guid_to_string(bytes: &[u8]) -> String {
    format!(
        "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        bytes[3], bytes[2], bytes[1], bytes[0],
        bytes[5], bytes[4],
        bytes[7], bytes[6],
        bytes[8], bytes[9],
        bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]
    )
}

fn gpt_type_name(guid: &str) -> Option<&'static str> {
    let name = match guid {
        "C12A7328-F81F-11D2-BA4B-00A0C93EC93B" => "efi_system",
        "21686148-6449-6E6F-744E-656564454649" => "bios_boot",
        "E3C9E316-0B5C-4DB8-817D-F92DF00215AE" => "microsoft_reserved",
        "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7" => "microsoft_basic_data",
        "DE94BBA4-06D1-4D40-A16A-BFD50179D6AC" => "windows_recovery",
        "0FC63DAF-8483-4772-8E79-3D69D8477DE4" => "linux_filesystem",
        "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F" => "linux_swap",
        "E6D6D379-F507-44C2-A23C-238F2A3DF928" => "linux_lvm",
        "4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709" => "linux_root_x86_64",
        "7C3457EF-0000-11AA-AA11-00306543ECAC" => "apple_apfs",
        "48465300-0000-11AA-AA11-00306543ECAC" => "apple_hfs",
        "516E7CB4-6ECF-11D6-8FF8-00022D09712B" => "freebsd_data",
        _ => return None,
    };
    Some(name)
}

fn utf16_name(bytes: &[u8]) -> Option<String> {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    let name = String::from_utf16_lossy(&units);
    let trimmed = name.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn finish_partitioned(
    file: &mut File,
    mut metadata: TypeMetadata,
    table: &str,
    bootable: bool,
    partitions: Vec<Partition>,
) -> Result<TypeMetadata, AnalysisError> {
    let mut described = Vec::with_capacity(partitions.len());
    let mut found: Vec<Filesystem> = Vec::new();

    for partition in &partitions {
        let fs = if partition.kind == "extended" {
            None
        } else {
            probe_filesystem(file, partition.start_lba.saturating_mul(LBA_SIZE))?
        };

        let mut entry = json!({
            "index": partition.index,
            "type": partition.kind,
            "bootable": partition.bootable,
            "start_lba": partition.start_lba,
            "size_bytes": partition.sectors.saturating_mul(LBA_SIZE),
        });
        if let Some(name) = &partition.name {
            entry["name"] = json!(name);
        }
        if let Some(fs) = fs {
            entry["filesystem"] = json!(fs.name);
            found.push(fs);
        }
        described.push(entry);
    }

    // FAT is usually the boot or EFI partition; prefer whatever holds the system.
    let primary_fs = found
        .iter()
        .find(|fs| !fs.name.starts_with("fat"))
        .or(found.first())
        .cloned();

    metadata.insert("partition_table".into(), json!(table));
    metadata.insert("bootable".into(), json!(bootable));
    metadata.insert("partition_count".into(), json!(partitions.len()));
    metadata.insert("partitions".into(), Value::Array(described));
    match primary_fs {
        Some(fs) => fs.insert_into(&mut metadata),
        None => {
            metadata.insert("os_family".into(), json!(os_family_for_partitions(&partitions)));
        }
    }
    Ok(metadata)
}

fn os_family_for_partitions(partitions: &[Partition]) -> &'static str {
    let kinds: Vec<&str> = partitions.iter().map(|p| p.kind.as_str()).collect();
    if kinds.iter().any(|k| k.starts_with("microsoft") || k.starts_with("windows") || *k == "ntfs") {
        "windows"
    } else if kinds.iter().any(|k| k.starts_with("linux")) {
        "linux"
    } else if kinds.iter().any(|k| k.starts_with("apple")) {
        "macos"
    } else if kinds.iter().any(|k| k.starts_with("freebsd") || *k == "openbsd") {
        "bsd"
    } else {
        "unknown"
    }
}

/// A filesystem recognised from its superblock or boot record.
#[derive(Debug, Clone)]
struct Filesystem {
    name: &'static str,
    os_family: &'static str,
    label: Option<String>,
}

impl Filesystem {
    fn insert_into(self, metadata: &mut TypeMetadata) {
        metadata.insert("filesystem".into(), json!(self.name));
        metadata.insert("os_family".into(), json!(self.os_family));
        if let Some(label) = self.label {
            metadata.insert("volume_label".into(), json!(label));
        }
    }
}

/// Looks for a filesystem starting at byte `offset`.
fn probe_filesystem(file: &mut File, offset: u64) -> Result<Option<Filesystem>, AnalysisError> {
    let head = read_region(file, offset, 4096)?;
    if head.len() < 512 {
        return Ok(None);
    }

    if head.get(3..11) == Some(&b"NTFS    "[..]) {
        return Ok(Some(Filesystem {
            name: "ntfs",
            os_family: "windows",
            label: None,
        }));
    }
    if head.get(3..8) == Some(&b"EXFAT"[..]) {
        return Ok(Some(Filesystem {
            name: "exfat",
            os_family: "unknown",
            label: None,
        }));
    }
    if head.get(82..87) == Some(&b"FAT32"[..]) {
        return Ok(Some(Filesystem {
            name: "fat32",
            os_family: "unknown",
            label: head.get(71..82).and_then(ascii_field),
        }));
    }
    if head.get(54..57) == Some(&b"FAT"[..]) {
        return Ok(Some(Filesystem {
            name: "fat",
            os_family: "unknown",
            label: head.get(43..54).and_then(ascii_field),
        }));
    }
    if head.get(0..4) == Some(&b"hsqs"[..]) {
        return Ok(Some(Filesystem {
            name: "squashfs",
            os_family: "linux",
            label: None,
        }));
    }
    if head.get(32..36) == Some(&b"NXSB"[..]) {
        return Ok(Some(Filesystem {
            name: "apfs",
            os_family: "macos",
            label: None,
        }));
    }

    let superblock_at = EXT_SUPERBLOCK_OFFSET as usize;
    if let Some(sb) = head.get(superblock_at..superblock_at + 1024) {
        if u16_le(sb, 56) == Some(EXT_MAGIC) {
            let compat = u32_le(sb, 92).unwrap_or(0);
            let incompat = u32_le(sb, 96).unwrap_or(0);
            let name = if incompat & (EXT_INCOMPAT_EXTENTS | EXT_INCOMPAT_64BIT) != 0 {
                "ext4"
            } else if compat & EXT_COMPAT_HAS_JOURNAL != 0 {
                "ext3"
            } else {
                "ext2"
            };
            return Ok(Some(Filesystem {
                name,
                os_family: "linux",
                label: sb.get(120..136).and_then(ascii_field),
            }));
        }
        match sb.get(0..2) {
            Some(b"H+") => {
                return Ok(Some(Filesystem {
                    name: "hfsplus",
                    os_family: "macos",
                    label: None,
                }))
            }
            Some(b"HX") => {
                return Ok(Some(Filesystem {
                    name: "hfsx",
                    os_family: "macos",
                    label: None,
                }))
            }
            _ => {}
        }
    }

    Ok(None)
}

fn analyze_dmg(file: &mut File, len: u64) -> Result<TypeMetadata, AnalysisError> {
    if len >= UDIF_TRAILER_LEN {
        let trailer = read_region(file, len - UDIF_TRAILER_LEN, UDIF_TRAILER_LEN as usize)?;
        if trailer.get(0..4) == Some(&b"koly"[..]) {
            return analyze_udif(file, &trailer);
        }
    }

    match probe_filesystem(file, 0)? {
        Some(fs) if fs.os_family == "macos" => {
            let mut metadata = TypeMetadata::new();
            metadata.insert("format".into(), json!("raw"));
            metadata.insert("bootable".into(), json!(false));
            fs.insert_into(&mut metadata);
            Ok(metadata)
        }
        _ => Err(AnalysisError::Unrecognised {
            kind: "disk image",
            reason: "no UDIF trailer or Apple filesystem signature".into(),
        }),
    }
}

fn analyze_udif(file: &mut File, trailer: &[u8]) -> Result<TypeMetadata, AnalysisError> {
    let mut metadata = TypeMetadata::new();
    metadata.insert("format".into(), json!("udif"));
    metadata.insert("os_family".into(), json!("macos"));
    metadata.insert("bootable".into(), json!(false));

    if let Some(version) = u32_be(trailer, 4) {
        metadata.insert("udif_version".into(), json!(version));
    }
    if let Some(sectors) = u64_be(trailer, 492) {
        metadata.insert(
            "uncompressed_size_bytes".into(),
            json!(sectors.saturating_mul(LBA_SIZE)),
        );
    }

    let plist_offset = u64_be(trailer, 216).unwrap_or(0);
    let plist_len = u64_be(trailer, 224).unwrap_or(0);
    if plist_len > 0 && plist_len <= UDIF_MAX_PLIST_BYTES {
        let plist = read_region(file, plist_offset, plist_len as usize)?;
        let filesystem = if memmem::find(&plist, b"Apple_APFS").is_some() {
            Some("apfs")
        } else if memmem::find(&plist, b"Apple_HFSX").is_some() {
            Some("hfsx")
        } else if memmem::find(&plist, b"Apple_HFS").is_some() {
            Some("hfsplus")
        } else {
            None
        };
        if let Some(fs) = filesystem {
            metadata.insert("filesystem".into(), json!(fs));
        }
    }

    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::MetadataExtractor;
    use std::fs;
    use tempfile::TempDir;

    fn write_image(temp: &TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = temp.path().join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
        buf[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn padded(text: &str, width: usize) -> Vec<u8> {
        let mut field = text.as_bytes().to_vec();
        field.resize(width, b' ');
        field
    }

    /// Builds an ISO with a primary descriptor, optional boot record and Joliet descriptor.
    fn iso_bytes(system_id: &str, volume_id: &str, el_torito: bool, joliet: bool) -> Vec<u8> {
        let sectors = 16 + 4;
        let mut image = vec![0u8; sectors * ISO_SECTOR as usize];
        let mut sector = 16;

        let mut pvd = vec![0u8; ISO_SECTOR as usize];
        pvd[0] = 1;
        put(&mut pvd, 1, b"CD001");
        pvd[6] = 1;
        put(&mut pvd, 8, &padded(system_id, 32));
        put(&mut pvd, 40, &padded(volume_id, 32));
        put(&mut pvd, 80, &(sectors as u32).to_le_bytes());
        put(&mut pvd, 128, &2048u16.to_le_bytes());
        put(&mut image, sector * 2048, &pvd);
        sector += 1;

        if el_torito {
            let mut boot = vec![0u8; 2048];
            put(&mut boot, 1, b"CD001");
            boot[6] = 1;
            put(&mut boot, 7, b"EL TORITO SPECIFICATION");
            put(&mut image, sector * 2048, &boot);
            sector += 1;
        }
        if joliet {
            let mut svd = vec![0u8; 2048];
            svd[0] = 2;
            put(&mut svd, 1, b"CD001");
            svd[6] = 1;
            put(&mut svd, 88, b"%/E");
            put(&mut image, sector * 2048, &svd);
            sector += 1;
        }

        let mut terminator = vec![0u8; 2048];
        terminator[0] = 255;
        put(&mut terminator, 1, b"CD001");
        terminator[6] = 1;
        put(&mut image, sector * 2048, &terminator);
        image
    }

    fn extract(path: &Path, ext: &str) -> TypeMetadata {
        DiskImageExtractor.extract(path, ext).unwrap()
    }

    #[test]
    fn test_iso_identifiers_and_boot() {
        let temp = TempDir::new().unwrap();
        let path = write_image(
            &temp,
            "ubuntu.iso",
            &iso_bytes("LINUX", "Ubuntu 24.04 LTS amd64", true, true),
        );

        let m = extract(&path, ".iso");

        assert_eq!(m["format"], "iso9660");
        assert_eq!(m["filesystem"], "iso9660");
        assert_eq!(m["volume_id"], "Ubuntu 24.04 LTS amd64");
        assert_eq!(m["system_id"], "LINUX");
        assert_eq!(m["os_family"], "linux");
        assert_eq!(m["bootable"], true);
        assert_eq!(m["joliet"], true);
        assert_eq!(m["hybrid"], false);
        assert_eq!(m["volume_size_bytes"], 20 * 2048);
    }

    #[test]
    fn test_iso_windows_volume_label() {
        let temp = TempDir::new().unwrap();
        let path = write_image(
            &temp,
            "win.iso",
            &iso_bytes("", "CCCOMA_X64FRE_EN-US_DV9", true, false),
        );

        let m = extract(&path, ".iso");

        assert_eq!(m["os_family"], "windows");
        assert!(m.get("system_id").is_none());
        assert_eq!(m["joliet"], false);
    }

    #[test]
    fn test_darwin_is_not_windows() {
        assert_eq!(guess_os_family(Some("DARWIN_INSTALL"), None), "macos");
        assert_eq!(guess_os_family(None, Some("WIN32")), "windows");
        assert_eq!(guess_os_family(Some("DATA_DISC"), Some("LINUX")), "linux");
        assert_eq!(guess_os_family(Some("BACKUP"), None), "unknown");
    }

    #[test]
    fn test_hybrid_iso_is_bootable() {
        let temp = TempDir::new().unwrap();
        let mut bytes = iso_bytes("LINUX", "Fedora-WS-Live-40", false, false);
        put(&mut bytes, 510, &MBR_SIGNATURE);
        let path = write_image(&temp, "fedora.iso", &bytes);

        let m = extract(&path, ".iso");

        assert_eq!(m["hybrid"], true);
        assert_eq!(m["bootable"], true);
        assert_eq!(m["el_torito"], false);
    }

    #[test]
    fn test_udf_only_iso() {
        let temp = TempDir::new().unwrap();
        let mut bytes = vec![0u8; 20 * 2048];
        put(&mut bytes, 16 * 2048 + 1, b"BEA01");
        put(&mut bytes, 17 * 2048 + 1, b"NSR02");
        put(&mut bytes, 18 * 2048 + 1, b"TEA01");
        let path = write_image(&temp, "movie.iso", &bytes);

        let m = extract(&path, ".iso");

        assert_eq!(m["filesystem"], "udf");
        assert_eq!(m["udf"], true);
    }

    #[test]
    fn test_not_an_iso() {
        let temp = TempDir::new().unwrap();
        let path = write_image(&temp, "x.iso", &[0u8; 1000]);

        let err = DiskImageExtractor.extract(&path, ".iso").unwrap_err();

        assert!(matches!(err, AnalysisError::Unrecognised { .. }));
    }

    fn mbr_image(entries: &[(u8, u8, u32, u32)], total_sectors: usize) -> Vec<u8> {
        let mut image = vec![0u8; total_sectors * 512];
        for (i, (status, type_id, start, count)) in entries.iter().enumerate() {
            let at = MBR_TABLE_OFFSET + i * 16;
            image[at] = *status;
            image[at + 4] = *type_id;
            put(&mut image, at + 8, &start.to_le_bytes());
            put(&mut image, at + 12, &count.to_le_bytes());
        }
        put(&mut image, 510, &MBR_SIGNATURE);
        image
    }

    #[test]
    fn test_mbr_with_ntfs_partition() {
        let temp = TempDir::new().unwrap();
        let mut image = mbr_image(&[(0x80, 0x07, 2048, 4096)], 8192);
        put(&mut image, 2048 * 512 + 3, b"NTFS    ");
        let path = write_image(&temp, "win.img", &image);

        let m = extract(&path, ".img");

        assert_eq!(m["format"], "raw");
        assert_eq!(m["partition_table"], "mbr");
        assert_eq!(m["bootable"], true);
        assert_eq!(m["partition_count"], 1);
        assert_eq!(m["filesystem"], "ntfs");
        assert_eq!(m["os_family"], "windows");
        assert_eq!(m["partitions"][0]["type"], "ntfs");
        assert_eq!(m["partitions"][0]["size_bytes"], 4096 * 512);
    }

    #[test]
    fn test_mbr_with_ext4_partition() {
        let temp = TempDir::new().unwrap();
        let mut image = mbr_image(&[(0x00, 0x83, 4, 64)], 80);
        let sb = 4 * 512 + 1024;
        put(&mut image, sb + 56, &EXT_MAGIC.to_le_bytes());
        put(&mut image, sb + 92, &EXT_COMPAT_HAS_JOURNAL.to_le_bytes());
        put(&mut image, sb + 96, &EXT_INCOMPAT_EXTENTS.to_le_bytes());
        put(&mut image, sb + 120, b"rootfs");
        let path = write_image(&temp, "pi.img", &image);

        let m = extract(&path, ".img");

        assert_eq!(m["bootable"], false);
        assert_eq!(m["filesystem"], "ext4");
        assert_eq!(m["volume_label"], "rootfs");
        assert_eq!(m["os_family"], "linux");
    }

    #[test]
    fn test_gpt_partitions() {
        let temp = TempDir::new().unwrap();
        let mut image = mbr_image(&[(0x00, 0xEE, 1, 200)], 200);
        put(&mut image, 512, b"EFI PART");
        put(&mut image, 512 + 72, &2u64.to_le_bytes());
        put(&mut image, 512 + 80, &2u32.to_le_bytes());
        put(&mut image, 512 + 84, &128u32.to_le_bytes());

        // EFI system partition C12A7328-F81F-11D2-BA4B-00A0C93EC93B, mixed endian
        let efi = [
            0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E,
            0xC9, 0x3B,
        ];
        // Linux filesystem 0FC63DAF-8483-4772-8E79-3D69D8477DE4
        let linux = [
            0xAF, 0x3D, 0xC6, 0x0F, 0x83, 0x84, 0x72, 0x47, 0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47,
            0x7D, 0xE4,
        ];
        let entries = 2 * 512;
        put(&mut image, entries, &efi);
        put(&mut image, entries + 32, &34u64.to_le_bytes());
        put(&mut image, entries + 40, &99u64.to_le_bytes());
        let name: Vec<u8> = "EFI".encode_utf16().flat_map(u16::to_le_bytes).collect();
        put(&mut image, entries + 56, &name);
        put(&mut image, entries + 128, &linux);
        put(&mut image, entries + 128 + 32, &100u64.to_le_bytes());
        put(&mut image, entries + 128 + 40, &199u64.to_le_bytes());
        let path = write_image(&temp, "disk.img", &image);

        let m = extract(&path, ".img");

        assert_eq!(m["partition_table"], "gpt");
        assert_eq!(m["bootable"], true);
        assert_eq!(m["partition_count"], 2);
        assert_eq!(m["partitions"][0]["type"], "efi_system");
        assert_eq!(m["partitions"][0]["name"], "EFI");
        assert_eq!(m["partitions"][1]["type"], "linux_filesystem");
        assert_eq!(m["partitions"][1]["size_bytes"], 100 * 512);
        assert_eq!(m["os_family"], "linux");
    }

    #[test]
    fn test_gpt_with_oversized_entry_size_is_unrecognised() {
        let temp = TempDir::new().unwrap();
        let mut image = mbr_image(&[(0x00, 0xEE, 1, 7)], 8);
        put(&mut image, 512, b"EFI PART");
        put(&mut image, 512 + 72, &2u64.to_le_bytes());
        put(&mut image, 512 + 80, &128u32.to_le_bytes());
        put(&mut image, 512 + 84, &u32::MAX.to_le_bytes());
        let path = write_image(&temp, "hostile.img", &image);

        let err = DiskImageExtractor.extract(&path, ".img").unwrap_err();
        assert!(matches!(err, AnalysisError::Unrecognised { .. }));

        let name = libris_types::StoredName::parse("hostile.img").unwrap();
        let m = crate::analysis::ContentAnalyzer::new().analyze(&path, &name);
        let reason = m[crate::constants::ANALYSIS_ERROR_KEY].as_str().unwrap();
        assert!(reason.contains("entry size"));
    }

    #[test]
    fn test_gpt_with_unaligned_entry_size_is_unrecognised() {
        let temp = TempDir::new().unwrap();
        let mut image = mbr_image(&[(0x00, 0xEE, 1, 7)], 8);
        put(&mut image, 512, b"EFI PART");
        put(&mut image, 512 + 80, &4u32.to_le_bytes());
        put(&mut image, 512 + 84, &200u32.to_le_bytes());
        let path = write_image(&temp, "odd.img", &image);

        assert!(DiskImageExtractor.extract(&path, ".img").is_err());
    }

    #[test]
    fn test_bare_filesystem_image() {
        let temp = TempDir::new().unwrap();
        let mut image = vec![0u8; 4096];
        put(&mut image, 1024 + 56, &EXT_MAGIC.to_le_bytes());
        let path = write_image(&temp, "fs.img", &image);

        let m = extract(&path, ".img");

        assert_eq!(m["partition_table"], "none");
        assert_eq!(m["filesystem"], "ext2");
    }

    #[test]
    fn test_fat32_volume_boot_record() {
        let temp = TempDir::new().unwrap();
        let mut image = vec![0u8; 4096];
        put(&mut image, 71, b"USBSTICK   ");
        put(&mut image, 82, b"FAT32   ");
        put(&mut image, 510, &MBR_SIGNATURE);
        let path = write_image(&temp, "stick.img", &image);

        let m = extract(&path, ".img");

        assert_eq!(m["partition_table"], "none");
        assert_eq!(m["filesystem"], "fat32");
        assert_eq!(m["volume_label"], "USBSTICK");
    }

    #[test]
    fn test_img_containing_iso() {
        let temp = TempDir::new().unwrap();
        let path = write_image(&temp, "cd.img", &iso_bytes("", "DEBIAN_12", true, false));

        let m = extract(&path, ".img");

        assert_eq!(m["format"], "iso9660");
        assert_eq!(m["os_family"], "linux");
    }

    #[test]
    fn test_unrecognised_img() {
        let temp = TempDir::new().unwrap();
        let path = write_image(&temp, "noise.img", &[0x11u8; 8192]);

        assert!(DiskImageExtractor.extract(&path, ".img").is_err());
    }

    #[test]
    fn test_udif_trailer() {
        let temp = TempDir::new().unwrap();
        let plist = b"<plist><string>Apple_APFS</string></plist>";
        let mut image = vec![0u8; 1024];
        put(&mut image, 100, plist);

        let mut trailer = vec![0u8; 512];
        put(&mut trailer, 0, b"koly");
        put(&mut trailer, 4, &4u32.to_be_bytes());
        put(&mut trailer, 216, &100u64.to_be_bytes());
        put(&mut trailer, 224, &(plist.len() as u64).to_be_bytes());
        put(&mut trailer, 492, &2048u64.to_be_bytes());
        image.extend_from_slice(&trailer);
        let path = write_image(&temp, "app.dmg", &image);

        let m = extract(&path, ".dmg");

        assert_eq!(m["format"], "udif");
        assert_eq!(m["os_family"], "macos");
        assert_eq!(m["udif_version"], 4);
        assert_eq!(m["uncompressed_size_bytes"], 2048 * 512);
        assert_eq!(m["filesystem"], "apfs");
    }

    #[test]
    fn test_raw_hfs_dmg() {
        let temp = TempDir::new().unwrap();
        let mut image = vec![0u8; 4096];
        put(&mut image, 1024, b"H+");
        let path = write_image(&temp, "old.dmg", &image);

        let m = extract(&path, ".dmg");

        assert_eq!(m["format"], "raw");
        assert_eq!(m["filesystem"], "hfsplus");
    }

    #[test]
    fn test_dmg_without_signatures() {
        let temp = TempDir::new().unwrap();
        let path = write_image(&temp, "bad.dmg", &[0u8; 2048]);

        assert!(DiskImageExtractor.extract(&path, ".dmg").is_err());
    }
}
