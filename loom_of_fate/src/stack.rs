//! # Stack Allocation
//!
//! Each thread needs its own stack - a space for its local thoughts.
//! Stacks are anonymous, private mappings handed to us by the host, so a
//! thread's sanctuary never overlaps another's or the host's own stack.
//!
//! ## Sizing
//! Unless asked otherwise we give a thread as much room as the host gives
//! its own main thread: the `RLIMIT_STACK` soft limit when it is finite,
//! otherwise [`FALLBACK_STACK_SIZE`]. Sizes are always whole pages.
//!
//! ## Guard page
//! Every mapping carries one extra page below the usable region, protected
//! with `PROT_NONE`. A thread that runs off the bottom of its stack faults
//! there instead of writing into whatever the host mapped next to it.

use std::io;

use log::debug;
use memmap2::{MmapMut, MmapOptions};
use spin::Once;
use x86_64::VirtAddr;

use crate::error::{LwpError, Result};

/// Stack size used when the host's stack limit is unlimited: 8 MiB
pub const FALLBACK_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Minimum stack size: 64 KiB
///
/// Smaller hints are raised to this. Panic reporting and log formatting
/// both run on the thread's own stack and need the headroom.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Page size assumed when the host will not tell us
const FALLBACK_PAGE_SIZE: usize = 4096;

static DEFAULT_STACK_SIZE: Once<usize> = Once::new();
static PAGE_SIZE: Once<usize> = Once::new();

/// The host's page size in bytes.
pub fn page_size() -> usize {
    *PAGE_SIZE.call_once(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size)
            .ok()
            .filter(|&size| size > 0)
            .unwrap_or(FALLBACK_PAGE_SIZE)
    })
}

/// Round `size` up to a whole number of pages.
pub fn round_to_pages(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page).saturating_mul(page)
}

/// The stack size used when `create` is given no hint.
///
/// Computed once per process from `RLIMIT_STACK`.
pub fn default_stack_size() -> usize {
    *DEFAULT_STACK_SIZE.call_once(|| {
        let size = host_stack_limit().unwrap_or(FALLBACK_STACK_SIZE);
        round_to_pages(size.max(MIN_STACK_SIZE))
    })
}

/// The soft `RLIMIT_STACK`, or `None` if it is unlimited or unreadable.
fn host_stack_limit() -> Option<usize> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };

    // SAFETY: `limit` is a valid, writable rlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_STACK, &mut limit) } != 0 {
        return None;
    }

    if limit.rlim_cur == libc::RLIM_INFINITY {
        None
    } else {
        usize::try_from(limit.rlim_cur).ok()
    }
}

/// A thread's stack region
///
/// The region is mapped on [`Stack::acquire`] and unmapped exactly once,
/// when the `Stack` is dropped. It never moves and never changes size.
/// `region` starts with the guard page; everything else describes only the
/// usable bytes above it.
pub struct Stack {
    region: MmapMut,
    guard: usize,
}

impl Stack {
    /// Map a new stack.
    ///
    /// # Arguments
    /// * `requested` - Size hint in bytes. `None` uses [`default_stack_size`];
    ///   a hint is raised to [`MIN_STACK_SIZE`] and rounded up to whole pages.
    ///
    /// # Errors
    /// [`LwpError::ResourceExhausted`] if the host refuses the mapping.
    pub fn acquire(requested: Option<usize>) -> Result<Self> {
        let size = match requested {
            Some(hint) => round_to_pages(hint.max(MIN_STACK_SIZE)),
            None => default_stack_size(),
        };

        let guard = page_size();
        let region = Self::map(size, guard).map_err(|source| LwpError::ResourceExhausted { size, source })?;

        let stack = Stack { region, guard };
        debug!(
            "mapped {}-byte stack at {:#x}..{:#x}",
            stack.size(),
            stack.bottom().as_u64(),
            stack.top().as_u64()
        );
        Ok(stack)
    }

    fn map(size: usize, guard: usize) -> io::Result<MmapMut> {
        let total = size
            .checked_add(guard)
            .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        let region = MmapOptions::new().len(total).stack().map_anon()?;

        // SAFETY: the first `guard` bytes are a whole page at the start of a
        // mapping we own and nothing references yet.
        let rc = unsafe {
            libc::mprotect(region.as_ptr() as *mut libc::c_void, guard, libc::PROT_NONE)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(region)
    }

    /// Get the bottom (low address) of the stack
    pub fn bottom(&self) -> VirtAddr {
        self.guard_page() + self.guard as u64
    }

    /// The inaccessible page directly below [`Stack::bottom`]
    pub fn guard_page(&self) -> VirtAddr {
        VirtAddr::new(self.region.as_ptr() as u64)
    }

    /// Get the top (high address) of the stack
    ///
    /// The stack grows downward, so this is one past the last usable byte.
    pub fn top(&self) -> VirtAddr {
        self.bottom() + self.size() as u64
    }

    /// Get the size of the stack in bytes
    pub fn size(&self) -> usize {
        self.region.len() - self.guard
    }

    /// Check if an address is within this stack
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.bottom() && addr < self.top()
    }

    /// Check whether two stacks share any byte
    pub fn overlaps(&self, other: &Stack) -> bool {
        self.bottom() < other.top() && other.bottom() < self.top()
    }

    /// Raw pointer to the lowest byte, for writing the bootstrap frame
    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        // SAFETY: `guard` is less than the mapping's length.
        unsafe { self.region.as_mut_ptr().add(self.guard) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // The mapping itself is released when `region` drops right after this.
        debug!(
            "unmapping {}-byte stack at {:#x}",
            self.size(),
            self.bottom().as_u64()
        );
    }
}

impl core::fmt::Debug for Stack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stack")
            .field("guard_page", &self.guard_page())
            .field("bottom", &self.bottom())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_size_is_whole_pages() {
        let size = default_stack_size();
        assert!(size >= MIN_STACK_SIZE);
        assert_eq!(size % page_size(), 0);
    }

    #[test]
    fn test_stack_allocation() {
        let stack = Stack::acquire(None).expect("Failed to map stack");
        assert_eq!(stack.size(), default_stack_size());
        assert!(stack.top() > stack.bottom());
        assert_eq!(stack.top() - stack.bottom(), stack.size() as u64);
    }

    #[test]
    fn test_hint_rounding() {
        let stack = Stack::acquire(Some(MIN_STACK_SIZE + 1)).expect("Failed to map stack");
        assert_eq!(stack.size(), MIN_STACK_SIZE + page_size());
    }

    #[test]
    fn test_small_hint_is_raised() {
        let stack = Stack::acquire(Some(100)).expect("Failed to map stack");
        assert_eq!(stack.size(), MIN_STACK_SIZE);
    }

    #[test]
    fn test_region_is_writable_end_to_end() {
        let mut stack = Stack::acquire(Some(MIN_STACK_SIZE)).expect("Failed to map stack");
        let size = stack.size();
        let base = stack.as_mut_ptr();
        unsafe {
            base.write(0xA5);
            base.add(size - 1).write(0x5A);
            assert_eq!(base.read(), 0xA5);
            assert_eq!(base.add(size - 1).read(), 0x5A);
        }
    }

    #[test]
    fn test_contains() {
        let stack = Stack::acquire(Some(MIN_STACK_SIZE)).expect("Failed to map stack");
        let bottom = stack.bottom();
        let top = stack.top();

        assert!(stack.contains(bottom));
        assert!(stack.contains(bottom + 100u64));
        assert!(stack.contains(top - 1u64));
        assert!(!stack.contains(top));
        assert!(!stack.contains(bottom - 1u64));
    }

    #[test]
    fn test_stacks_never_overlap() {
        let stacks: Vec<Stack> = (0..8)
            .map(|_| Stack::acquire(Some(MIN_STACK_SIZE)).expect("Failed to map stack"))
            .collect();

        for (i, a) in stacks.iter().enumerate() {
            assert!(a.overlaps(a));
            for b in &stacks[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn test_stack_is_not_the_host_stack() {
        let local = 0u64;
        let here = VirtAddr::new(&local as *const u64 as u64);
        let stack = Stack::acquire(None).expect("Failed to map stack");
        assert!(!stack.contains(here));
    }

    #[test]
    fn test_guard_page_sits_below_the_stack() {
        let stack = Stack::acquire(Some(MIN_STACK_SIZE)).expect("Failed to map stack");
        assert_eq!(stack.bottom() - stack.guard_page(), page_size() as u64);
        assert!(!stack.contains(stack.guard_page()));
    }

    #[test]
    fn test_usable_regions_are_never_adjacent() {
        let stacks: Vec<Stack> = (0..8)
            .map(|_| Stack::acquire(Some(MIN_STACK_SIZE)).expect("Failed to map stack"))
            .collect();

        for a in &stacks {
            for b in &stacks {
                // Running off the bottom of `a` must never land in `b`.
                assert!(!b.contains(a.bottom() - 1u64), "{a:?} sits on top of {b:?}");
            }
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_guard_page_is_inaccessible() {
        let stack = Stack::acquire(Some(MIN_STACK_SIZE)).expect("Failed to map stack");
        let guard = stack.guard_page().as_u64();
        let bottom = stack.bottom().as_u64();

        let maps = std::fs::read_to_string("/proc/self/maps").expect("Failed to read maps");
        let permissions = |addr: u64| {
            maps.lines()
                .find_map(|line| {
                    let (range, rest) = line.split_once(' ')?;
                    let (start, end) = range.split_once('-')?;
                    let start = u64::from_str_radix(start, 16).ok()?;
                    let end = u64::from_str_radix(end, 16).ok()?;
                    (start..end).contains(&addr).then(|| rest[..4].to_string())
                })
                .expect("address is not mapped")
        };

        assert_eq!(permissions(guard), "---p");
        assert_eq!(permissions(bottom), "rw-p");
    }
}
