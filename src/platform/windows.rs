//! Windows backend: VirtualAlloc/VirtualFree.

use core::ffi::c_void;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const PAGE_READWRITE: u32 = 0x04;

unsafe extern "system" {
    fn VirtualAlloc(
        lpAddress: *mut c_void,
        dwSize: usize,
        flAllocationType: u32,
        flProtect: u32,
    ) -> *mut c_void;

    fn VirtualFree(lpAddress: *mut c_void, dwSize: usize, dwFreeType: u32) -> i32;
}

pub unsafe fn map(bytes: usize) -> *mut u8 {
    unsafe {
        VirtualAlloc(
            core::ptr::null_mut(),
            bytes,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        ) as *mut u8
    }
}

pub unsafe fn unmap(ptr: *mut u8, bytes: usize) {
    // VirtualFree with MEM_RELEASE requires size 0 and the base address.
    let _ = bytes;
    unsafe { VirtualFree(ptr as *mut c_void, 0, MEM_RELEASE) };
}
