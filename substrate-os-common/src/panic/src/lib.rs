#![no_std]

#[cfg(not(test))]
#[inline(never)]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    use core::sync::atomic::{self, Ordering};
    use log::error;

    error!("{}", info);

    // Halt the thread; there is nowhere left to unwind to.
    loop {
        atomic::compiler_fence(Ordering::SeqCst);
    }
}
