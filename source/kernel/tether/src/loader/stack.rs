// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Initial process stack: `[argc][argv..][0][envp..][0][(key, val)..][AT_NULL, 0]`
//! at a 16-byte aligned `sp`, with the strings and the AT_RANDOM bytes above it.

use tether_abi::auxv;

use super::LoadError;
use crate::mm::{align_down, PAGE_SIZE};

const WORD: usize = core::mem::size_of::<u64>();

/// Addresses of the pieces of a built startup image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackImage {
    pub sp: usize,
    pub argc: usize,
    pub argv: usize,
    pub envp: usize,
    pub auxv: usize,
    pub random: usize,
}

/// Writes into the caller's view of `[top - mem.len(), top)`.
struct Writer<'m> {
    mem: &'m mut [u8],
    base: usize,
    cursor: usize,
}

impl<'m> Writer<'m> {
    fn push(&mut self, bytes: &[u8], nul: bool) -> Result<usize, LoadError> {
        let len = bytes.len() + nul as usize;
        let addr = self
            .cursor
            .checked_sub(len)
            .filter(|&a| a >= self.base)
            .ok_or(LoadError::StackOverflow { needed: self.mem.len() + len })?;
        let at = addr - self.base;
        self.mem[at..at + bytes.len()].copy_from_slice(bytes);
        if nul {
            self.mem[at + bytes.len()] = 0;
        }
        self.cursor = addr;
        Ok(addr)
    }

    fn put_word(&mut self, addr: usize, value: u64) {
        let at = addr - self.base;
        self.mem[at..at + WORD].copy_from_slice(&value.to_le_bytes());
    }
}

impl StackImage {
    /// Lays out the startup image in `mem`, whose last byte sits just below `top`.
    ///
    /// `aux` adds image-derived entries; AT_PAGESZ and AT_RANDOM are always
    /// present and take precedence over caller-supplied copies.
    pub fn build(
        mem: &mut [u8],
        top: usize,
        argv: &[&str],
        envp: &[&str],
        aux: &[(u64, u64)],
        random: [u8; 16],
    ) -> Result<Self, LoadError> {
        let base = top.checked_sub(mem.len()).ok_or(LoadError::StackOverflow { needed: mem.len() })?;
        let mut writer = Writer { mem, base, cursor: top };

        let mut string_addrs = alloc::vec::Vec::with_capacity(argv.len() + envp.len());
        for s in argv.iter().chain(envp.iter()) {
            string_addrs.push(writer.push(s.as_bytes(), true)?);
        }
        writer.cursor = align_down(writer.cursor, 16);
        let random_addr = writer.push(&random, false)?;

        let fixed = [(auxv::AT_PAGESZ, PAGE_SIZE as u64), (auxv::AT_RANDOM, random_addr as u64)];
        let extra = aux
            .iter()
            .filter(|(k, _)| !matches!(*k, auxv::AT_NULL | auxv::AT_PAGESZ | auxv::AT_RANDOM));
        let aux_pairs = fixed.len() + extra.clone().count() + 1;
        let words = 1 + argv.len() + 1 + envp.len() + 1 + 2 * aux_pairs;

        let needed = top - writer.cursor + words * WORD + 15;
        let sp = writer
            .cursor
            .checked_sub(words * WORD)
            .map(|low| align_down(low, 16))
            .filter(|&sp| sp >= base)
            .ok_or(LoadError::StackOverflow { needed })?;

        let mut at = sp;
        let mut emit = |w: &mut Writer<'_>, value: u64| {
            w.put_word(at, value);
            at += WORD;
        };
        emit(&mut writer, argv.len() as u64);
        for addr in &string_addrs[..argv.len()] {
            emit(&mut writer, *addr as u64);
        }
        emit(&mut writer, 0);
        for addr in &string_addrs[argv.len()..] {
            emit(&mut writer, *addr as u64);
        }
        emit(&mut writer, 0);
        for (key, value) in fixed.iter().chain(extra) {
            emit(&mut writer, *key);
            emit(&mut writer, *value);
        }
        emit(&mut writer, auxv::AT_NULL);
        emit(&mut writer, 0);

        let argv_addr = sp + WORD;
        let envp_addr = argv_addr + (argv.len() + 1) * WORD;
        Ok(Self {
            sp,
            argc: argv.len(),
            argv: argv_addr,
            envp: envp_addr,
            auxv: envp_addr + (envp.len() + 1) * WORD,
            random: random_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;

    const TOP: usize = 0x4088_0000;

    fn word(mem: &[u8], addr: usize) -> u64 {
        let at = addr - (TOP - mem.len());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&mem[at..at + 8]);
        u64::from_le_bytes(raw)
    }

    fn c_str(mem: &[u8], addr: usize) -> &str {
        let at = addr - (TOP - mem.len());
        let len = mem[at..].iter().position(|&b| b == 0).expect("terminated");
        core::str::from_utf8(&mem[at..at + len]).expect("utf8")
    }

    fn auxv_pairs(mem: &[u8], image: &StackImage) -> Vec<(u64, u64)> {
        let mut pairs = Vec::new();
        let mut addr = image.auxv;
        loop {
            let (k, v) = (word(mem, addr), word(mem, addr + 8));
            if k == auxv::AT_NULL {
                break;
            }
            pairs.push((k, v));
            addr += 16;
        }
        pairs
    }

    #[test]
    fn layout_matches_the_process_entry_contract() {
        let mut mem = vec![0u8; 4096];
        let random = [7u8; 16];
        let image = StackImage::build(
            &mut mem,
            TOP,
            &["runtime", "-v"],
            &["GOMAXPROCS=1"],
            &[(auxv::AT_ENTRY, 0x4900_0100), (auxv::AT_PAGESZ, 1)],
            random,
        )
        .expect("fits");

        assert_eq!(image.sp % 16, 0);
        assert_eq!(word(&mem, image.sp), 2);
        assert_eq!(image.argv, image.sp + 8);
        assert_eq!(c_str(&mem, word(&mem, image.argv) as usize), "runtime");
        assert_eq!(c_str(&mem, word(&mem, image.argv + 8) as usize), "-v");
        assert_eq!(word(&mem, image.argv + 16), 0);
        assert_eq!(c_str(&mem, word(&mem, image.envp) as usize), "GOMAXPROCS=1");
        assert_eq!(word(&mem, image.envp + 8), 0);

        let pairs = auxv_pairs(&mem, &image);
        assert_eq!(pairs[0], (auxv::AT_PAGESZ, 4096));
        assert_eq!(pairs[1], (auxv::AT_RANDOM, image.random as u64));
        assert!(pairs.contains(&(auxv::AT_ENTRY, 0x4900_0100)));
        assert_eq!(pairs.iter().filter(|(k, _)| *k == auxv::AT_PAGESZ).count(), 1);

        let at = image.random - (TOP - mem.len());
        assert_eq!(mem[at..at + 16], random);
        assert!(image.random > image.sp);
    }

    #[test]
    fn empty_vectors_still_terminate() {
        let mut mem = vec![0u8; 256];
        let image = StackImage::build(&mut mem, TOP, &[], &[], &[], [0; 16]).expect("fits");
        assert_eq!(image.argc, 0);
        assert_eq!(word(&mem, image.sp), 0);
        assert_eq!(word(&mem, image.argv), 0);
        assert_eq!(word(&mem, image.envp), 0);
        assert_eq!(auxv_pairs(&mem, &image).len(), 2);
    }

    #[test]
    fn reports_overflow() {
        let mut mem = vec![0u8; 64];
        let err = StackImage::build(&mut mem, TOP, &["a-rather-long-program-name"], &[], &[], [0; 16]);
        assert!(matches!(err, Err(LoadError::StackOverflow { .. })));
    }
}
