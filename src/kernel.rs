//! The kernel singleton: every shared subsystem, plus boot, printing and
//! panic plumbing.

use core::fmt::{self, Write};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Once;

use crate::{
    bio::Bcache,
    console::{self, Console, CONSOLE_MAJOR},
    cpu::{cpuid, Cpus},
    file::{Devsw, FTable},
    fs::{FileSystem, Itable},
    kalloc::Kmem,
    lock::{SleepableLock, Spinlock},
    page::Page,
    param::NDEV,
    plic,
    proc::Procs,
    trap,
    uart::{self, UartTx},
    virtio::{Disk, VirtioDisk},
    vm::KernelMemory,
};

/// The kernel.
static KERNEL: Kernel = Kernel::new();

/// The kernel is a static, so it is safe to access from anywhere; its
/// subsystems guard themselves.
#[inline]
pub fn kernel() -> &'static Kernel {
    &KERNEL
}

pub struct Kernel {
    panicked: AtomicBool,

    /// Sleeps waiting for there to be input in the console buffer.
    console: SleepableLock<Console>,

    /// Sleeps waiting for there to be room in the UART transmit ring.
    uart_tx: SleepableLock<UartTx>,

    printer: Spinlock<Printer>,

    kmem: Spinlock<Kmem>,

    /// The kernel's page table; built once at boot.
    memory: Once<KernelMemory>,

    /// Clock ticks since boot; sleepers wait on its channel.
    ticks: SleepableLock<u32>,

    procs: Procs,

    cpus: Cpus,

    bcache: Bcache,

    devsw: [Devsw; NDEV],

    ftable: FTable,

    itable: Itable,

    fs: FileSystem,

    disk: Disk,
}

impl Kernel {
    const fn new() -> Self {
        const EMPTY_DEV: Devsw = Devsw {
            read: None,
            write: None,
        };
        let mut devsw = [EMPTY_DEV; NDEV];
        devsw[CONSOLE_MAJOR] = Devsw {
            read: Some(console::read),
            write: Some(console::write),
        };

        Self {
            panicked: AtomicBool::new(false),
            console: SleepableLock::new("cons", Console::new()),
            uart_tx: SleepableLock::new("uart", UartTx::new()),
            printer: Spinlock::new("pr", Printer::new()),
            kmem: Spinlock::new("kmem", Kmem::new()),
            memory: Once::new(),
            ticks: SleepableLock::new("time", 0),
            procs: Procs::new(),
            cpus: Cpus::new(),
            bcache: Bcache::new(),
            devsw,
            ftable: FTable::new(),
            itable: Itable::new(),
            fs: FileSystem::new(),
            disk: SleepableLock::new("virtio_disk", VirtioDisk::new()),
        }
    }

    pub fn cpus(&self) -> &Cpus {
        &self.cpus
    }

    pub fn procs(&self) -> &Procs {
        &self.procs
    }

    pub fn ticks(&self) -> &SleepableLock<u32> {
        &self.ticks
    }

    pub fn bcache(&self) -> &Bcache {
        &self.bcache
    }

    pub fn ftable(&self) -> &FTable {
        &self.ftable
    }

    pub fn itable(&self) -> &Itable {
        &self.itable
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub fn disk(&self) -> &Disk {
        &self.disk
    }

    pub fn console(&self) -> &SleepableLock<Console> {
        &self.console
    }

    pub fn uart_tx(&self) -> &SleepableLock<UartTx> {
        &self.uart_tx
    }

    pub fn devsw(&self, major: usize) -> Option<Devsw> {
        self.devsw.get(major).copied()
    }

    /// Allocate one 4096-byte page of physical memory.
    pub fn alloc(&self) -> Option<Page> {
        self.kmem.lock().alloc()
    }

    /// Free a page that was allocated with `alloc`.
    pub fn free(&self, page: Page) {
        self.kmem.lock().free(page);
    }

    fn panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Print the given formatted string with the printer.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        if self.is_panicked() {
            // The printer lock stays untouched after a panic, so the dying
            // hart's output cannot wedge on it. Other harts stop printing
            // entirely (see the panic handler), which keeps the output
            // from interleaving.
            // SAFETY: other harts no longer print.
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            self.printer.lock().write_fmt(args)
        }
    }
}

/// Console printing, serialized by one spinlock so that multi-hart output
/// stays whole.
pub struct Printer;

impl Printer {
    const fn new() -> Self {
        Self
    }
}

impl Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            console::putc(b);
        }
        Ok(())
    }
}

/// print! prints to the console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::kernel::kernel().printer_write_fmt(format_args!($($arg)*)).unwrap()
    };
}

/// println! prints to the console, with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Handle a kernel panic: freeze the other harts' console output and spin.
#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    kernel().panic();
    println!("{}", info);

    loop {
        spin_loop();
    }
}

/// start() jumps here in supervisor mode on all harts.
pub unsafe fn kernel_main() -> ! {
    static STARTED: AtomicBool = AtomicBool::new(false);

    if cpuid() == 0 {
        // Console.
        unsafe { uart::init() };

        println!();
        println!("kestrel kernel is booting");
        println!();

        // Physical page allocator.
        unsafe { kernel().kmem.lock().init() };

        // Build the kernel page table, then turn on paging.
        let memory = KernelMemory::new().expect("kernel_main: KernelMemory::new");
        let memory = kernel().memory.call_once(|| memory);
        unsafe { memory.init_hart() };

        // Process table.
        unsafe { kernel().procs.init() };

        // Trap vectors, and the kernel trap vector on this hart.
        trap::trapinit();
        unsafe { trap::trapinithart() };

        // Set up the interrupt controller, and ask it for device
        // interrupts on this hart.
        unsafe { plic::plicinit() };
        unsafe { plic::plicinithart() };

        // Emulated hard disk.
        unsafe { kernel().disk.init() };

        // First user process.
        unsafe { kernel().procs.user_proc_init() };

        STARTED.store(true, Ordering::Release);
    } else {
        while !STARTED.load(Ordering::Acquire) {
            spin_loop();
        }

        println!("hart {} starting", cpuid());

        // Turn on paging.
        // SAFETY: hart 0 built the page table before setting STARTED.
        unsafe { kernel().memory.get().expect("memory").init_hart() };

        // Install the kernel trap vector.
        unsafe { trap::trapinithart() };

        // Ask the PLIC for device interrupts.
        unsafe { plic::plicinithart() };
    }

    unsafe { kernel().procs().scheduler() }
}
