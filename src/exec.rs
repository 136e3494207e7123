//! The ELF loader: replace a process's user image with a program from the
//! file system.

use core::cmp;
use core::mem;

use bitflags::bitflags;
use itertools::izip;
use zerocopy::{AsBytes, FromBytes};

use crate::{
    error::{KernelError, Result},
    fs::Path,
    kernel::kernel,
    page::Page,
    param::MAXARG,
    proc::CurrentProc,
    riscv::{pgroundup, PteFlags, PGSIZE},
    vm::{PAddr, UserMemory},
};

/// "\x7FELF" in little endian.
const ELF_MAGIC: u32 = 0x464c_457f;

/// Program-header type for loadable segments.
const ELF_PROG_LOAD: u32 = 1;

/// File header.
// repr(C): in-disk representation.
#[derive(Default, Clone, AsBytes, FromBytes)]
#[repr(C)]
struct ElfHdr {
    /// Must equal ELF_MAGIC.
    magic: u32,
    elf: [u8; 12],
    typ: u16,
    machine: u16,
    version: u32,
    entry: usize,
    phoff: usize,
    shoff: usize,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

bitflags! {
    /// Flag bits for ProgHdr flags.
    #[repr(C)]
    #[derive(AsBytes, FromBytes)]
    struct ProgFlags: u32 {
        const EXEC = 1;
        const WRITE = 2;
        const READ = 4;
    }
}

impl Default for ProgFlags {
    fn default() -> Self {
        Self::from_bits_truncate(0)
    }
}

/// Program section header.
// repr(C): in-disk representation.
#[derive(Default, Clone, AsBytes, FromBytes)]
#[repr(C)]
struct ProgHdr {
    typ: u32,
    flags: ProgFlags,
    off: usize,
    vaddr: usize,
    paddr: usize,
    filesz: usize,
    memsz: usize,
    align: usize,
}

impl ElfHdr {
    fn is_valid(&self) -> bool {
        self.magic == ELF_MAGIC
    }
}

impl ProgHdr {
    fn is_prog_load(&self) -> bool {
        self.typ == ELF_PROG_LOAD
    }

    /// Page-table permission for a segment: X and W follow the header
    /// flags; R and U are implied for every user mapping.
    fn perm(&self) -> PteFlags {
        let mut perm = PteFlags::empty();
        if self.flags.contains(ProgFlags::EXEC) {
            perm |= PteFlags::X;
        }
        if self.flags.contains(ProgFlags::WRITE) {
            perm |= PteFlags::W;
        }
        perm
    }
}

/// Load `path` into a fresh user image and swap it in. `args` holds the
/// argument strings, one NUL-terminated string per page. Returns argc,
/// which lands in a0 via the syscall return path; a1 carries argv.
pub fn exec(proc: &mut CurrentProc<'_>, path: &Path, args: &[Page]) -> Result<usize> {
    if args.len() > MAXARG {
        return Err(KernelError::ExecFailed);
    }

    let tx = kernel().fs().begin_tx();
    let ptr = kernel().itable().namei(path, &tx)?;
    let ptr = scopeguard::guard(ptr, |ptr| ptr.put(&tx));
    let mut ip = ptr.lock();

    // Check the ELF header.
    let mut elf = ElfHdr::default();
    ip.read_kernel(&mut elf, 0)
        .map_err(|_| KernelError::ExecFailed)?;
    if !elf.is_valid() {
        return Err(KernelError::ExecFailed);
    }

    let trap_frame = PAddr::from(proc.deref_data().trap_frame as usize);
    let mut mem = UserMemory::new(trap_frame, None)?;

    // Load each program segment into memory.
    for i in 0..elf.phnum as usize {
        let off = elf.phoff + i * mem::size_of::<ProgHdr>();

        let mut ph = ProgHdr::default();
        ip.read_kernel(&mut ph, off as u32)
            .map_err(|_| KernelError::ExecFailed)?;
        if !ph.is_prog_load() {
            continue;
        }
        if ph.memsz < ph.filesz || ph.vaddr % PGSIZE != 0 {
            return Err(KernelError::ExecFailed);
        }
        let newsz = ph
            .vaddr
            .checked_add(ph.memsz)
            .ok_or(KernelError::ExecFailed)?;
        let _ = mem.alloc(newsz, ph.perm())?;
        mem.load_file(ph.vaddr.into(), &mut ip, ph.off as u32, ph.filesz as u32)?;
    }
    drop(ip);
    drop(ptr);
    drop(tx);

    // Allocate two pages at the next page boundary: the lower is the stack
    // guard (made inaccessible), the upper the user stack.
    let sz = pgroundup(mem.size());
    let sz = mem.alloc(sz + 2 * PGSIZE, PteFlags::W)?;
    mem.clear_user((sz - 2 * PGSIZE).into());
    let mut sp = sz;
    let stackbase = sp - PGSIZE;

    // Push the argument strings; record their addresses in ustack.
    let mut ustack = [0usize; MAXARG + 1];
    for (arg, slot) in izip!(args, &mut ustack) {
        let len = arg
            .iter()
            .position(|c| *c == 0)
            .expect("exec: argument is not null terminated")
            + 1;
        sp -= len;

        // The riscv sp must be 16-byte aligned.
        sp &= !0xf;
        if sp < stackbase {
            return Err(KernelError::ExecFailed);
        }

        mem.copy_out_bytes(sp.into(), &arg[..len])?;
        *slot = sp;
    }
    let argc = args.len();
    ustack[argc] = 0;

    // Push the array of argv[] pointers.
    let argv_size = (argc + 1) * mem::size_of::<usize>();
    sp -= argv_size;
    sp &= !0xf;
    if sp < stackbase {
        return Err(KernelError::ExecFailed);
    }
    // SAFETY: any byte of a usize is a valid u8.
    let (_, bytes, _) = unsafe { ustack.align_to::<u8>() };
    mem.copy_out_bytes(sp.into(), &bytes[..argv_size])?;

    // Save the program name, for debugging.
    let path_bytes = path.as_bytes();
    let name = path_bytes
        .iter()
        .rposition(|c| *c == b'/')
        .map(|i| &path_bytes[i + 1..])
        .unwrap_or(path_bytes);
    let data = proc.deref_mut_data();
    let len = cmp::min(data.name.len() - 1, name.len());
    data.name[..len].copy_from_slice(&name[..len]);
    data.name[len] = 0;

    // Commit to the new image.
    let old = mem::replace(proc.memory_mut(), mem);
    drop(old);

    // Arguments to user main(argc, argv): argc is returned via the system
    // call return value in a0; argv goes in a1.
    let tf = proc.trap_frame_mut();
    tf.a1 = sp;

    // Initial program counter = main; initial stack pointer.
    tf.epc = elf.entry;
    tf.sp = sp;

    Ok(argc)
}
