//! Irreversible wiping of protected regions.
//!
//! - **Volatile writes**: overwrite passes go through `ptr::write_volatile`.
//! - **Fences**: a compiler fence follows every pass.
//! - **Paranoid mode**: with the `paranoid` feature, ones, then random
//!   bytes, then zeros.

use zeroize::Zeroize;

/// Irreversibly overwrites `slice`, ending with all zeros.
#[inline(never)]
pub fn burn_slice(slice: &mut [u8]) {
    #[cfg(feature = "paranoid")]
    {
        use rand_core::{OsRng, RngCore};

        for byte in slice.iter_mut() {
            unsafe { core::ptr::write_volatile(byte, 0xFF) };
        }
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);

        let mut noise = [0u8; 64];
        for chunk in slice.chunks_mut(noise.len()) {
            OsRng.fill_bytes(&mut noise[..chunk.len()]);
            for (byte, n) in chunk.iter_mut().zip(noise.iter()) {
                unsafe { core::ptr::write_volatile(byte, *n) };
            }
        }
        noise.zeroize();
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
    }

    slice.zeroize();
    core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
}
