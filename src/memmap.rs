//! Memory-map queries: page state and free-page discovery.
//!
//! `find_free_page` prefers searching *backwards* from the hint because
//! executable blocks placed below a target stay reachable through a 32-bit
//! `rel32` on 64-bit hosts.

use crate::address::Address;

#[cfg(windows)]
mod imp {
    use super::*;
    use core::ffi::c_void;
    use std::mem::MaybeUninit;

    use windows_sys::Win32::System::Memory::{
        VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_FREE, MEM_RESERVE,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    fn query(base: Address) -> Option<MEMORY_BASIC_INFORMATION> {
        let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { MaybeUninit::zeroed().assume_init() };
        let written = unsafe {
            VirtualQuery(
                base.as_ptr::<c_void>(),
                &mut mbi,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        (written != 0).then_some(mbi)
    }

    /// Whether the page containing `base` is committed or reserved.
    pub fn is_memory_page_occupied(base: Address) -> bool {
        query(base).map_or(false, |mbi| mbi.State != MEM_FREE)
    }

    /// Whether the page containing `base` is reserved but not committed.
    pub fn is_memory_page_reserved(base: Address) -> bool {
        query(base).map_or(false, |mbi| mbi.State & MEM_RESERVE != 0)
    }

    fn system_info() -> SYSTEM_INFO {
        let mut info: SYSTEM_INFO = unsafe { MaybeUninit::zeroed().assume_init() };
        unsafe { GetSystemInfo(&mut info) };
        info
    }

    /// The allocation granularity new reservations snap to.
    pub fn allocation_granularity() -> usize {
        system_info().dwAllocationGranularity as usize
    }

    fn application_address_bounds() -> (usize, usize) {
        let info = system_info();
        (
            info.lpMinimumApplicationAddress as usize,
            info.lpMaximumApplicationAddress as usize,
        )
    }

    fn find_prev_free_page(page: Address, min_address: usize, granularity: usize) -> Address {
        let mut address = page - page % granularity;
        address -= granularity;

        while address.value() >= min_address {
            let Some(mbi) = query(address) else { break };

            if mbi.State == MEM_FREE {
                return address;
            }

            let base = mbi.AllocationBase as usize;
            if base < granularity {
                break;
            }
            address = Address::new(base - granularity);
        }

        Address::NULL
    }

    fn find_next_free_page(page: Address, max_address: usize, granularity: usize) -> Address {
        let mut address = page - page % granularity;
        address += granularity;

        while address.value() <= max_address {
            let Some(mbi) = query(address) else { break };

            if mbi.State == MEM_FREE {
                return address;
            }

            address = Address::new(mbi.BaseAddress as usize) + mbi.RegionSize;
            address += granularity - 1;
            address -= address % granularity;
        }

        Address::NULL
    }

    /// Finds the free page nearest to `page` within `[page - range,
    /// page + range]`, searching backwards first. Zero when nothing is
    /// free.
    pub fn find_free_page(page: Address, range: usize) -> Address {
        let granularity = allocation_granularity();
        let (mut min_address, mut max_address) = application_address_bounds();

        if page.value() > range {
            min_address = min_address.max(page.value() - range);
        }
        max_address = max_address.min(page.value().saturating_add(range));

        let below = find_prev_free_page(page, min_address, granularity);
        if below.valid() {
            return below;
        }

        find_next_free_page(page, max_address, granularity)
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use crate::protect::Protection;

    use lazy_static::lazy_static;
    use regex::Regex;
    use std::fs::File;
    use std::io::{self, BufRead, BufReader};

    /// One mapped region of the process, as reported by `/proc/self/maps`.
    #[derive(Debug, Clone, Copy)]
    pub(crate) struct Region {
        pub begin: usize,
        pub end: usize,
        pub protect: Protection,
    }

    impl Region {
        fn parse(line: &str) -> io::Result<Self> {
            lazy_static! {
                static ref RE: Regex =
                    Regex::new("^([0-9a-fA-F]+)-([0-9a-fA-F]+) ([rwxps-]{4})").unwrap();
            }
            let bad = || io::Error::new(io::ErrorKind::InvalidData, "bad maps line");

            let caps = RE.captures(line).ok_or_else(bad)?;
            let begin = usize::from_str_radix(&caps[1], 16).map_err(|_| bad())?;
            let end = usize::from_str_radix(&caps[2], 16).map_err(|_| bad())?;

            let perms = &caps[3];
            let mut protect = Protection::empty();
            if perms.contains('r') {
                protect |= Protection::READ;
            }
            if perms.contains('w') {
                protect |= Protection::WRITE;
            }
            if perms.contains('x') {
                protect |= Protection::EXECUTE;
            }
            if protect.is_empty() {
                protect = Protection::NO_ACCESS;
            }

            Ok(Self { begin, end, protect })
        }
    }

    pub(crate) fn snapshot() -> io::Result<Vec<Region>> {
        let maps = File::open("/proc/self/maps")?;
        BufReader::new(maps)
            .lines()
            .map(|line| line.and_then(|line| Region::parse(&line)))
            .collect()
    }

    pub(crate) fn region_at(base: Address) -> Option<Region> {
        snapshot()
            .ok()?
            .into_iter()
            .find(|region| region.begin <= base.value() && base.value() < region.end)
    }

    /// Whether the page containing `base` is mapped.
    pub fn is_memory_page_occupied(base: Address) -> bool {
        region_at(base).is_some()
    }

    /// Always false: mmap has no reserved-but-uncommitted state.
    pub fn is_memory_page_reserved(_base: Address) -> bool {
        false
    }

    /// The allocation granularity new mappings snap to (the page size).
    pub fn allocation_granularity() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    fn is_span_free(regions: &[Region], begin: usize, end: usize) -> bool {
        !regions
            .iter()
            .any(|region| region.begin < end && begin < region.end)
    }

    /// Finds the free page nearest to `page` within `[page - range,
    /// page + range]`, searching backwards first. Zero when nothing is
    /// free.
    pub fn find_free_page(page: Address, range: usize) -> Address {
        let granularity = allocation_granularity();
        let Ok(regions) = snapshot() else {
            return Address::NULL;
        };

        let min_address = granularity.max(page.value().saturating_sub(range));
        // Stay clear of the top of the canonical user address range.
        let max_address = 1usize.checked_shl(46).unwrap_or(usize::MAX).min(page.value().saturating_add(range));

        let aligned = page.value() - page.value() % granularity;

        let mut address = aligned.saturating_sub(granularity);
        while address >= min_address {
            if is_span_free(&regions, address, address + granularity) {
                return Address::new(address);
            }
            let below = regions
                .iter()
                .filter(|region| region.begin <= address)
                .map(|region| region.begin)
                .max()
                .unwrap_or(0);
            if below < granularity * 2 {
                break;
            }
            address = (below - granularity) - (below % granularity);
        }

        let mut address = aligned + granularity;
        while address <= max_address {
            if is_span_free(&regions, address, address + granularity) {
                return Address::new(address);
            }
            let above = regions
                .iter()
                .filter(|region| region.end > address)
                .map(|region| region.end)
                .min()
                .unwrap_or(usize::MAX);
            if above == usize::MAX {
                break;
            }
            address = above + (granularity - above % granularity) % granularity;
        }

        Address::NULL
    }
}

pub use imp::{allocation_granularity, find_free_page, is_memory_page_occupied, is_memory_page_reserved};

#[cfg(unix)]
pub(crate) use imp::region_at;

/// Whether the page containing `base` is unmapped.
#[must_use]
pub fn is_memory_page_free(base: Address) -> bool {
    !is_memory_page_occupied(base)
}
