//! Minimal ELF64 program loader: reads `PT_LOAD` segments out of a raw
//! image and maps them into a process's address space, then sets up its
//! entry point and argv on the user stack.
//!
//! Each segment gets at most two pages, classified `CODE_SEGMENT`/
//! `DATA_SEGMENT` by its program header flags: a one-page segment comes
//! from `alloc_page`, a two-page segment from `alloc_two_page` so the
//! pair is physically adjacent, and anything larger is rejected rather
//! than silently loaded.

use crate::param::MAXARG;
use crate::pmm::PMM;
use crate::proc::{MappedRegion, Proc, SegmentType};
use crate::riscv::{prot_to_type, PGSIZE, PROT_EXEC, PROT_READ, PROT_WRITE};
use crate::string::memset;
use crate::PGROUNDUP;

const ELF_MAGIC: u32 = 0x464c457f; // "\x7fELF", little-endian
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

#[derive(Debug)]
pub enum ElfError {
    TooShort,
    BadMagic,
    Not64Bit,
    TooManySegments,
    OutOfMemory,
    UnknownSegmentFlags(u32),
    SegmentTooLarge,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Ehdr {
    magic: u32,
    _ident_rest: [u8; 12],
    _type: u16,
    _machine: u16,
    _version: u32,
    entry: u64,
    phoff: u64,
    _shoff: u64,
    _flags: u32,
    _ehsize: u16,
    phentsize: u16,
    phnum: u16,
    _shentsize: u16,
    _shnum: u16,
    _shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    _p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    _p_align: u64,
}

fn read_at<T: Copy>(image: &[u8], offset: usize) -> Option<T> {
    let size = core::mem::size_of::<T>();
    if offset + size > image.len() {
        return None;
    }
    let mut value = core::mem::MaybeUninit::<T>::uninit();
    // SAFETY: `T` is a `#[repr(C)]` POD struct of fixed-width integers;
    // any byte pattern of the right length is a valid value.
    unsafe {
        core::ptr::copy_nonoverlapping(
            image.as_ptr().add(offset),
            value.as_mut_ptr() as *mut u8,
            size,
        );
        Some(value.assume_init())
    }
}

/// Parses and maps every `PT_LOAD` segment of `image` into `proc`'s page
/// table, then points its trapframe at the entry point with `argv`
/// pushed onto the user stack the way a freshly `exec`'d process expects
/// to find it.
pub fn load(proc: &mut Proc, image: &[u8], argv: &[&str]) -> Result<(), ElfError> {
    let ehdr: Ehdr = read_at(image, 0).ok_or(ElfError::TooShort)?;
    if ehdr.magic != ELF_MAGIC {
        return Err(ElfError::BadMagic);
    }
    if ehdr.phentsize as usize != core::mem::size_of::<Phdr>() {
        return Err(ElfError::Not64Bit);
    }

    for i in 0..ehdr.phnum as usize {
        let off = ehdr.phoff as usize + i * ehdr.phentsize as usize;
        let ph: Phdr = read_at(image, off).ok_or(ElfError::TooShort)?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        load_segment(proc, image, &ph)?;
    }

    let trapframe = proc.trapframe();
    trapframe.epc = ehdr.entry;

    let argv_va = load_argv_into_stack(proc, argv)?;
    let trapframe = proc.trapframe();
    trapframe.a0 = argv.len() as u64;
    trapframe.a1 = argv_va as u64;
    Ok(())
}

fn load_segment(proc: &mut Proc, image: &[u8], ph: &Phdr) -> Result<(), ElfError> {
    if ph.p_memsz < ph.p_filesz {
        return Err(ElfError::TooShort);
    }
    let npages = PGROUNDUP!(ph.p_memsz as usize) / PGSIZE;
    if npages > 2 {
        return Err(ElfError::SegmentTooLarge);
    }
    let va_base = ph.p_vaddr as usize;

    let seg_type = match ph.p_flags & (PF_R | PF_W | PF_X) {
        f if f == PF_R | PF_X => SegmentType::Code,
        f if f == PF_R | PF_W => SegmentType::Data,
        other => return Err(ElfError::UnknownSegmentFlags(other)),
    };
    let prot = match seg_type {
        SegmentType::Code => PROT_READ | PROT_EXEC,
        _ => PROT_READ | PROT_WRITE,
    };

    // One or two pages only, the second case physically adjacent so the
    // pair comes from a single `alloc_two_page` rather than two
    // independent `alloc_page` calls. A zero-size segment needs no page
    // at all.
    let first_pa = match npages {
        0 => 0,
        2 => PMM.alloc_two_page().ok_or(ElfError::OutOfMemory)?,
        _ => PMM.alloc_page().ok_or(ElfError::OutOfMemory)?,
    };

    for page in 0..npages {
        let pa = first_pa + page * PGSIZE;
        memset(pa as *mut u8, 0, PGSIZE);

        let page_off = page * PGSIZE;
        let file_remaining = (ph.p_filesz as usize).saturating_sub(page_off);
        if file_remaining > 0 {
            let copy_len = file_remaining.min(PGSIZE);
            let src_off = ph.p_offset as usize + page_off;
            let src = image
                .get(src_off..src_off + copy_len)
                .ok_or(ElfError::TooShort)?;
            // SAFETY: `pa` was just allocated and zeroed above.
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr(), pa as *mut u8, copy_len);
            }
        }

        crate::vm::mappages(
            proc.pagetable(),
            va_base + page_off,
            pa,
            PGSIZE,
            prot_to_type(prot, true),
        )
        .map_err(|_| ElfError::OutOfMemory)?;
    }

    let idx = proc.total_mapped_region;
    if idx >= proc.mapped_info.len() {
        return Err(ElfError::TooManySegments);
    }
    proc.mapped_info[idx] = MappedRegion {
        va: va_base,
        npages: npages as u32,
        seg_type,
    };
    proc.total_mapped_region += 1;
    Ok(())
}

/// Writes each argv string into its own slot just below the stack top,
/// then a pointer array just below that, mirroring a conventional
/// `argv`/`argc` startup layout. Returns the pushed argv array's virtual
/// address.
fn load_argv_into_stack(proc: &mut Proc, argv: &[&str]) -> Result<usize, ElfError> {
    const MAX_ARGUMENT_LENGTH: usize = 128;
    if argv.len() > MAXARG {
        return Err(ElfError::TooManySegments);
    }

    let mut sp = proc.trapframe().sp as usize;
    let mut pointers = [0u64; MAXARG];

    for (i, arg) in argv.iter().enumerate() {
        sp -= MAX_ARGUMENT_LENGTH;
        let bytes = arg.as_bytes();
        let len = bytes.len().min(MAX_ARGUMENT_LENGTH - 1);
        let mut buf = [0u8; MAX_ARGUMENT_LENGTH];
        buf[..len].copy_from_slice(&bytes[..len]);
        if !crate::vm::copyout(proc.pagetable(), sp, &buf) {
            return Err(ElfError::OutOfMemory);
        }
        pointers[i] = sp as u64;
    }

    let array_bytes = argv.len() * core::mem::size_of::<u64>();
    sp -= array_bytes;
    if array_bytes > 0 {
        let bytes = unsafe {
            core::slice::from_raw_parts(pointers.as_ptr() as *const u8, array_bytes)
        };
        if !crate::vm::copyout(proc.pagetable(), sp, bytes) {
            return Err(ElfError::OutOfMemory);
        }
    }

    proc.trapframe().sp = sp as u64;
    Ok(sp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let image = [0u8; 64];
        let err = read_at::<Ehdr>(&image, 0).map(|h| h.magic == ELF_MAGIC);
        assert_eq!(err, Some(false));
    }

    #[test]
    fn segment_flag_classification() {
        assert_eq!(PF_R | PF_X, 5);
        assert_eq!(PF_R | PF_W, 6);
    }
}
