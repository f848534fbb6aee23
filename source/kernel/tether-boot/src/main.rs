// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot wrapper for the TETHER kernel. Provides `_start`, which parks secondary
//! cores, drops to EL1, enables FP/SIMD and sets up the boot stack before handing
//! execution to `tether::kernel_entry()` with the runtime to host.
#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
use tether::mm::layout::{ARG_AREA, BOOT_STACK};
#[cfg(target_os = "none")]
use tether::RuntimeEntry;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text._start, "ax"
    .global _start
_start:
    mrs     x0, mpidr_el1
    and     x0, x0, #0xff
    cbz     x0, 2f
1:  wfe
    b       1b
2:  mrs     x0, CurrentEL
    lsr     x0, x0, #2
    cmp     x0, #2
    b.ne    3f
    /* EL2: AArch64 EL1, counters visible to EL1, return to EL1h with DAIF set. */
    mov     x0, #(1 << 31)
    msr     hcr_el2, x0
    mov     x0, #3
    msr     cnthctl_el2, x0
    msr     cntvoff_el2, xzr
    mov     x0, #0x3c5
    msr     spsr_el2, x0
    adr     x0, 3f
    msr     elr_el2, x0
    eret
3:  mov     x0, #(3 << 20)
    msr     cpacr_el1, x0
    isb
    ldr     x0, ={boot_sp}
    mov     sp, x0
    bl      tether_boot_main
4:  wfe
    b       4b
"#,
    boot_sp = const BOOT_STACK.end() - ARG_AREA,
);

#[cfg(all(target_os = "none", tether_payload))]
static PAYLOAD: &[u8] = include_bytes!(env!("TETHER_PAYLOAD_PATH"));

#[cfg(target_os = "none")]
#[no_mangle]
pub extern "C" fn tether_boot_main() -> ! {
    #[cfg(tether_payload)]
    let entry = RuntimeEntry::Image { elf: PAYLOAD, argv: &["runtime"], envp: &[] };
    #[cfg(not(tether_payload))]
    let entry = RuntimeEntry::Direct(demo::run);
    tether::kernel_entry(entry)
}

/// Runtime linked into the kernel image when no payload is supplied. Talks to the
/// kernel only through `svc`, like a hosted binary would.
#[cfg(target_os = "none")]
#[allow(dead_code)]
mod demo {
    use tether_abi::{decode_result, nr, MmapFlags};

    const GREETING: &[u8] = b"demo runtime: hello\n";

    pub fn run() -> i32 {
        syscall(nr::WRITE, [1, GREETING.as_ptr() as usize, GREETING.len(), 0, 0, 0]);
        let flags = (MmapFlags::PRIVATE | MmapFlags::ANONYMOUS).bits();
        let Ok(base) = decode_result(syscall(nr::MMAP, [0, 0x4000, 3, flags, usize::MAX, 0])) else {
            return 1;
        };
        let words = base as *mut u64;
        let mut sum = 0u64;
        for i in 0..2048 {
            // SAFETY: four fresh demand pages were just handed out by mmap.
            unsafe {
                words.add(i).write_volatile(i as u64);
                sum += words.add(i).read_volatile();
            }
        }
        let mut random = [0u8; 8];
        syscall(nr::GETRANDOM, [random.as_mut_ptr() as usize, random.len(), 0, 0, 0, 0]);
        i32::from(sum != 2047 * 2048 / 2)
    }

    fn syscall(number: usize, args: [usize; 6]) -> usize {
        let ret: usize;
        // SAFETY: `svc #0` enters the kernel syscall path, which preserves all but x0.
        unsafe {
            core::arch::asm!(
                "svc #0",
                inlateout("x0") args[0] => ret,
                in("x1") args[1],
                in("x2") args[2],
                in("x3") args[3],
                in("x4") args[4],
                in("x5") args[5],
                in("x8") number,
                options(nostack),
            );
        }
        ret
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("tether-boot only runs on aarch64-unknown-none; see tether's host tests instead");
}
