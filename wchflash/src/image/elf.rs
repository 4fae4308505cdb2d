//! ELF32 little-endian decoding.
//!
//! Only `PT_LOAD` segments with file data are kept. Segments are placed at
//! their physical (load) address, which is where the linker put them in
//! flash even when they run from RAM.

use super::flatten;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Seek, SeekFrom};

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const EHDR_SIZE: usize = 52;
const PHDR_SIZE: u16 = 32;
const PT_LOAD: u32 = 1;

struct ProgramHeader {
    p_type: u32,
    offset: u32,
    paddr: u32,
    filesz: u32,
}

fn read_phdr(cur: &mut Cursor<&[u8]>) -> std::io::Result<ProgramHeader> {
    let p_type = cur.read_u32::<LittleEndian>()?;
    let offset = cur.read_u32::<LittleEndian>()?;
    let _vaddr = cur.read_u32::<LittleEndian>()?;
    let paddr = cur.read_u32::<LittleEndian>()?;
    let filesz = cur.read_u32::<LittleEndian>()?;
    Ok(ProgramHeader {
        p_type,
        offset,
        paddr,
        filesz,
    })
}

/// Decode an ELF image into `(base_address, flat_payload)`.
pub fn decode(bytes: &[u8]) -> Result<(u32, Vec<u8>), String> {
    if bytes.len() < EHDR_SIZE || &bytes[..4] != ELF_MAGIC {
        return Err("not an ELF file".to_string());
    }
    if bytes[4] != ELFCLASS32 {
        return Err("only 32-bit ELF images are supported".to_string());
    }
    if bytes[5] != ELFDATA2LSB {
        return Err("only little-endian ELF images are supported".to_string());
    }

    let truncated = |_: std::io::Error| "truncated ELF header".to_string();
    let mut cur = Cursor::new(bytes);
    cur.seek(SeekFrom::Start(28)).map_err(truncated)?;
    let phoff = cur.read_u32::<LittleEndian>().map_err(truncated)?;
    cur.seek(SeekFrom::Start(42)).map_err(truncated)?;
    let phentsize = cur.read_u16::<LittleEndian>().map_err(truncated)?;
    let phnum = cur.read_u16::<LittleEndian>().map_err(truncated)?;

    if phnum == 0 {
        return Err("no program headers".to_string());
    }
    if phentsize < PHDR_SIZE {
        return Err(format!("program header entry size {phentsize} is too small"));
    }

    let mut regions = Vec::new();
    for i in 0..u64::from(phnum) {
        let at = u64::from(phoff) + i * u64::from(phentsize);
        cur.seek(SeekFrom::Start(at))
            .map_err(|_| format!("program header {i} out of bounds"))?;
        let ph = read_phdr(&mut cur).map_err(|_| format!("program header {i} is truncated"))?;
        if ph.p_type != PT_LOAD || ph.filesz == 0 {
            continue;
        }

        let start = ph.offset as usize;
        let end = start
            .checked_add(ph.filesz as usize)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| format!("segment {i} data lies outside the file"))?;
        regions.push((ph.paddr, bytes[start..end].to_vec()));
    }

    if regions.is_empty() {
        return Err("no loadable segments".to_string());
    }
    flatten(regions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    /// Build a minimal ELF32 LE image with the given `(paddr, data)` load segments.
    fn build_elf(segments: &[(u32, &[u8])]) -> Vec<u8> {
        let phoff = EHDR_SIZE as u32;
        let data_start = phoff + u32::from(PHDR_SIZE) * segments.len() as u32;

        let mut out = Vec::new();
        out.extend_from_slice(ELF_MAGIC);
        out.extend_from_slice(&[ELFCLASS32, ELFDATA2LSB, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.write_u16::<LittleEndian>(2).unwrap(); // ET_EXEC
        out.write_u16::<LittleEndian>(0xF3).unwrap(); // EM_RISCV
        out.write_u32::<LittleEndian>(1).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap(); // entry
        out.write_u32::<LittleEndian>(phoff).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap(); // shoff
        out.write_u32::<LittleEndian>(0).unwrap(); // flags
        out.write_u16::<LittleEndian>(EHDR_SIZE as u16).unwrap();
        out.write_u16::<LittleEndian>(PHDR_SIZE).unwrap();
        out.write_u16::<LittleEndian>(segments.len() as u16).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        assert_eq!(out.len(), EHDR_SIZE);

        let mut offset = data_start;
        for (paddr, data) in segments {
            out.write_u32::<LittleEndian>(PT_LOAD).unwrap();
            out.write_u32::<LittleEndian>(offset).unwrap();
            out.write_u32::<LittleEndian>(*paddr).unwrap(); // vaddr
            out.write_u32::<LittleEndian>(*paddr).unwrap();
            out.write_u32::<LittleEndian>(data.len() as u32).unwrap();
            out.write_u32::<LittleEndian>(data.len() as u32).unwrap();
            out.write_u32::<LittleEndian>(5).unwrap();
            out.write_u32::<LittleEndian>(4).unwrap();
            offset += data.len() as u32;
        }
        for (_, data) in segments {
            out.extend_from_slice(data);
        }
        out
    }

    #[test]
    fn test_decode_two_segments() {
        let elf = build_elf(&[(0x0000_0000, &[1u8, 2, 3, 4][..]), (0x0000_0008, &[9u8, 9][..])]);
        let (base, data) = decode(&elf).unwrap();
        assert_eq!(base, 0);
        assert_eq!(data, vec![1, 2, 3, 4, 0xFF, 0xFF, 0xFF, 0xFF, 9, 9]);
    }

    #[test]
    fn test_rejects_non_elf() {
        assert!(decode(&[0u8; 64]).unwrap_err().contains("not an ELF"));
        assert!(decode(b"\x7fELF").is_err());
    }

    #[test]
    fn test_rejects_elf64() {
        let mut elf = build_elf(&[(0, &[1u8, 2, 3, 4][..])]);
        elf[4] = 2;
        assert!(decode(&elf).unwrap_err().contains("32-bit"));
    }

    #[test]
    fn test_rejects_segment_outside_file() {
        let mut elf = build_elf(&[(0, &[1u8, 2, 3, 4][..])]);
        elf.truncate(elf.len() - 2);
        assert!(decode(&elf).unwrap_err().contains("outside the file"));
    }
}
