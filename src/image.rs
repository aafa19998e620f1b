//! Normalizes an on-disk a.out image into the flat file the trampoline maps,
//! and probes the kernel's minimum-mmap-address policy.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd;
use tracing::debug;

use crate::aout::{Exec, ImageLayout};
use crate::error::{Error, Result};

const CHUNK: usize = 64;

static STAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Copies the text and data segments of `source` into a freshly created
/// staging file laid out exactly as the trampoline will map it: text bytes,
/// then zero padding up to `layout.data_offset` (none if 0), then data
/// bytes. The bss segment is not written; the trampoline allocates it as
/// anonymous zero-fill memory.
///
/// Runs before any process is forked; the returned file is positioned at
/// offset 0.
pub fn normalize(source: &mut File, header: &Exec, layout: ImageLayout) -> Result<File> {
    let path = stage_path();
    debug!(path = %path.display(), "normalizing image");
    let mut target = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;

    source.seek(SeekFrom::Start(layout.text_offset as u64))?;
    copy_exact(source, &mut target, header.a_text)?;
    if layout.data_offset > header.a_text {
        write_zeroes(&mut target, layout.data_offset - header.a_text)?;
    }
    copy_exact(source, &mut target, header.a_data)?;

    target.seek(SeekFrom::Start(0))?;
    Ok(target)
}

fn stage_path() -> PathBuf {
    let seq = STAGE_SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("aout86-image-{}-{seq}", std::process::id()))
}

fn copy_exact(source: &mut File, target: &mut File, mut remainder: u32) -> Result<()> {
    let mut buffer = [0u8; CHUNK];
    while remainder > 0 {
        let take = (remainder as usize).min(CHUNK);
        source.read_exact(&mut buffer[..take])?;
        target.write_all(&buffer[..take])?;
        remainder -= take as u32;
    }
    Ok(())
}

fn write_zeroes(target: &mut File, mut remainder: u32) -> Result<()> {
    let buffer = [0u8; CHUNK];
    while remainder > 0 {
        let take = (remainder as usize).min(CHUNK);
        target.write_all(&buffer[..take])?;
        remainder -= take as u32;
    }
    Ok(())
}

/// The image descriptor must survive into the exec'd helper; `File` opens
/// with `O_CLOEXEC`, so the flag has to be dropped explicitly.
pub fn clear_cloexec(file: &File) -> Result<()> {
    fcntl(file.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok(())
}

/// Fails fast when `vm.mmap_min_addr` forbids the mapping this image needs,
/// so the operator gets a clear diagnostic instead of an opaque mapping
/// error inside the tracee. Root bypasses the policy.
pub fn check_mapping_policy(required: u32) -> Result<()> {
    if unistd::getuid().is_root() {
        return Ok(());
    }
    let text = fs::read_to_string("/proc/sys/vm/mmap_min_addr")?;
    let policy: u32 = text.trim().parse().unwrap_or(0);
    if policy > required {
        return Err(Error::MappingPolicy { policy, required });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aout::{MagicKind, HEADER_LEN, MAGIC_NMAGIC, MAGIC_OMAGIC, MAGIC_ZMAGIC, M_386};

    fn header(magic: u32, text: u32, data: u32) -> Exec {
        Exec {
            a_info: magic | (M_386 << 16),
            a_text: text,
            a_data: data,
            a_bss: 0x40,
            a_syms: 0,
            a_entry: 0,
            a_trsize: 0,
            a_drsize: 0,
        }
    }

    fn image_file(text_offset: u32, text: &[u8], data: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0u8; text_offset as usize]).unwrap();
        file.write_all(text).unwrap();
        file.write_all(data).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file
    }

    fn contents(mut file: File) -> Vec<u8> {
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn omagic_output_is_text_then_data() {
        let text = vec![0xaa; 100];
        let data = vec![0xbb; 30];
        let header = header(MAGIC_OMAGIC, 100, 30);
        let layout = MagicKind::Omagic.layout().unwrap();
        let mut source = image_file(HEADER_LEN as u32, &text, &data);
        let out = contents(normalize(&mut source, &header, layout).unwrap());
        assert_eq!(out.len(), 130);
        assert_eq!(&out[..100], &text[..]);
        assert_eq!(&out[100..], &data[..]);
    }

    #[test]
    fn nmagic_output_pads_data_to_page_boundary() {
        let text = vec![0xaa; 100];
        let data = vec![0xbb; 30];
        let header = header(MAGIC_NMAGIC, 100, 30);
        let layout = MagicKind::Nmagic.layout().unwrap();
        let mut source = image_file(HEADER_LEN as u32, &text, &data);
        let out = contents(normalize(&mut source, &header, layout).unwrap());
        assert_eq!(out.len(), 0x1000 + 30);
        assert_eq!(&out[..100], &text[..]);
        assert!(out[100..0x1000].iter().all(|&b| b == 0));
        assert_eq!(&out[0x1000..], &data[..]);
    }

    #[test]
    fn zmagic_output_skips_leading_kilobyte() {
        let text = vec![0xaa; 70];
        let data = vec![0xbb; 130];
        let header = header(MAGIC_ZMAGIC, 70, 130);
        let layout = MagicKind::Zmagic.layout().unwrap();
        let mut source = image_file(0x400, &text, &data);
        let out = contents(normalize(&mut source, &header, layout).unwrap());
        assert_eq!(out.len(), 200);
        assert_eq!(&out[..70], &text[..]);
        assert_eq!(&out[70..], &data[..]);
    }

    #[test]
    fn bss_is_never_staged() {
        // a_bss is nonzero in every fixture header; output size must not
        // include it.
        let header = header(MAGIC_OMAGIC, 8, 8);
        let layout = MagicKind::Omagic.layout().unwrap();
        let mut source = image_file(HEADER_LEN as u32, &[1; 8], &[2; 8]);
        let out = contents(normalize(&mut source, &header, layout).unwrap());
        assert_eq!(out.len(), 16);
    }
}
