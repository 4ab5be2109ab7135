//! Picking the QEMU tracer variant able to run a target binary.

use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};
use thiserror::Error;

#[cfg(target_arch = "x86_64")]
pub static HOST_QEMU_ARCH: &str = "x86_64";

#[cfg(target_arch = "x86")]
pub static HOST_QEMU_ARCH: &str = "i386";

#[cfg(target_arch = "aarch64")]
pub static HOST_QEMU_ARCH: &str = "aarch64";

#[cfg(target_arch = "arm")]
pub static HOST_QEMU_ARCH: &str = "arm";

#[cfg(all(target_arch = "mips64", target_endian = "little"))]
pub static HOST_QEMU_ARCH: &str = "mips64el";

#[cfg(all(target_arch = "powerpc64", target_endian = "little"))]
pub static HOST_QEMU_ARCH: &str = "ppc64le";

#[cfg(target_arch = "riscv64")]
pub static HOST_QEMU_ARCH: &str = "riscv64";

#[cfg(target_arch = "s390x")]
pub static HOST_QEMU_ARCH: &str = "s390x";

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm",
    all(target_arch = "mips64", target_endian = "little"),
    all(target_arch = "powerpc64", target_endian = "little"),
    target_arch = "riscv64",
    target_arch = "s390x"
)))]
pub static HOST_QEMU_ARCH: &str = "unknown";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("{0} is not an ELF binary")]
    NotElf(PathBuf),
    #[error("{path}: unsupported machine type {machine}")]
    UnsupportedMachine { path: PathBuf, machine: u16 },
}

/// Binary introspection used to pick the execution-mode variant for a target.
pub trait ArchProbe {
    /// Name of the QEMU user-mode arch the target needs, e.g. `x86_64`.
    fn qemu_arch(&self, binary: &Path) -> Result<String, ProbeError>;
}

/// Reads the ELF identification and `e_machine` fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct ElfProbe;

const EM_386: u16 = 3;
const EM_MIPS: u16 = 8;
const EM_PPC: u16 = 20;
const EM_PPC64: u16 = 21;
const EM_S390: u16 = 22;
const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;
const EM_RISCV: u16 = 243;

impl ArchProbe for ElfProbe {
    fn qemu_arch(&self, binary: &Path) -> Result<String, ProbeError> {
        let io_err = |source| ProbeError::Io {
            path: binary.to_path_buf(),
            source,
        };
        let mut header = [0_u8; 20];
        let mut f = File::open(binary).map_err(io_err)?;
        if let Err(e) = f.read_exact(&mut header) {
            return if e.kind() == io::ErrorKind::UnexpectedEof {
                Err(ProbeError::NotElf(binary.to_path_buf()))
            } else {
                Err(io_err(e))
            };
        }
        qemu_arch_of(&header).ok_or_else(|| {
            if &header[..4] != b"\x7fELF" {
                ProbeError::NotElf(binary.to_path_buf())
            } else {
                ProbeError::UnsupportedMachine {
                    path: binary.to_path_buf(),
                    machine: machine(&header),
                }
            }
        })
    }
}

fn machine(header: &[u8; 20]) -> u16 {
    let raw = [header[18], header[19]];
    if header[5] == 2 {
        u16::from_be_bytes(raw)
    } else {
        u16::from_le_bytes(raw)
    }
}

fn qemu_arch_of(header: &[u8; 20]) -> Option<String> {
    if &header[..4] != b"\x7fELF" {
        return None;
    }
    let is_64 = header[4] == 2;
    let big_endian = header[5] == 2;

    let arch = match (machine(header), is_64, big_endian) {
        (EM_386, _, _) => "i386",
        (EM_X86_64, _, _) => "x86_64",
        (EM_ARM, _, false) => "arm",
        (EM_ARM, _, true) => "armeb",
        (EM_AARCH64, _, false) => "aarch64",
        (EM_AARCH64, _, true) => "aarch64_be",
        (EM_MIPS, false, false) => "mipsel",
        (EM_MIPS, false, true) => "mips",
        (EM_MIPS, true, false) => "mips64el",
        (EM_MIPS, true, true) => "mips64",
        (EM_PPC, _, _) => "ppc",
        (EM_PPC64, _, false) => "ppc64le",
        (EM_PPC64, _, true) => "ppc64",
        (EM_RISCV, true, _) => "riscv64",
        (EM_RISCV, false, _) => "riscv32",
        (EM_S390, _, _) => "s390x",
        _ => return None,
    };
    Some(arch.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;

    fn header(class: u8, data: u8, machine: u16) -> Vec<u8> {
        let mut h = vec![0_u8; 64];
        h[..4].copy_from_slice(b"\x7fELF");
        h[4] = class;
        h[5] = data;
        let m = if data == 2 {
            machine.to_be_bytes()
        } else {
            machine.to_le_bytes()
        };
        h[18..20].copy_from_slice(&m);
        h
    }

    #[test]
    fn maps_common_machines() {
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            (header(2, 1, EM_X86_64), "x86_64"),
            (header(1, 1, EM_386), "i386"),
            (header(1, 1, EM_ARM), "arm"),
            (header(2, 1, EM_AARCH64), "aarch64"),
            (header(1, 2, EM_MIPS), "mips"),
            (header(2, 1, EM_MIPS), "mips64el"),
            (header(2, 2, EM_PPC64), "ppc64"),
            (header(2, 1, EM_RISCV), "riscv64"),
        ];
        for (i, (h, want)) in cases.iter().enumerate() {
            let p = dir.path().join(format!("bin-{}", i));
            write(&p, h).unwrap();
            assert_eq!(ElfProbe.qemu_arch(&p).unwrap(), *want);
        }
    }

    #[test]
    fn rejects_non_elf_and_unknown_machines() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script.sh");
        write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        assert!(matches!(
            ElfProbe.qemu_arch(&script),
            Err(ProbeError::NotElf(_))
        ));

        let short = dir.path().join("short");
        write(&short, b"\x7fELF").unwrap();
        assert!(matches!(
            ElfProbe.qemu_arch(&short),
            Err(ProbeError::NotElf(_))
        ));

        let odd = dir.path().join("odd");
        write(&odd, header(2, 1, 0x1234)).unwrap();
        assert!(matches!(
            ElfProbe.qemu_arch(&odd),
            Err(ProbeError::UnsupportedMachine { machine: 0x1234, .. })
        ));

        assert!(matches!(
            ElfProbe.qemu_arch(&dir.path().join("missing")),
            Err(ProbeError::Io { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn probes_the_running_test_binary_as_host_arch() {
        let exe = std::env::current_exe().unwrap();
        assert_eq!(ElfProbe.qemu_arch(&exe).unwrap(), HOST_QEMU_ARCH);
    }
}
