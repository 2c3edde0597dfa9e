//! Locating gaps in the address space where code pools can be mapped.
//!
//! Trampoline slices must often land within near-jump reach of the
//! hooked function, so pools are sought outward from the hook target
//! instead of wherever the kernel prefers.

use crate::error::{Error, Result};
use std::ops::Range;

/// Returns candidate base addresses for a new code pool, all unmapped,
/// word aligned and inside the reachability `range`.
///
/// Sites above `origin` come first (macOS cannot map below the process
/// image), then the search walks downward from the origin.
pub fn pool_sites(origin: *const (), range: Range<usize>) -> impl Iterator<Item = Result<*const ()>> {
  let below = PoolSiteIter::new(origin, range.clone(), SearchDirection::Below);
  PoolSiteIter::new(origin, range, SearchDirection::Above).chain(below)
}

/// Direction the search walks from the hook target.
enum SearchDirection {
  Below,
  Above,
}

/// Walks mapped regions outward from an origin, yielding the start of
/// every unmapped gap encountered inside the reachability window.
struct PoolSiteIter {
  range: Range<usize>,
  search: SearchDirection,
  cursor: usize,
}

impl PoolSiteIter {
  fn new(origin: *const (), range: Range<usize>, search: SearchDirection) -> Self {
    PoolSiteIter {
      range,
      cursor: origin as usize,
      search,
    }
  }

  /// Advances the cursor past a mapped region.
  fn skip_region(&mut self, region: &region::Region) {
    let page_size = region::page::size();
    self.cursor = match self.search {
      SearchDirection::Below => region.as_range().start.saturating_sub(page_size),
      SearchDirection::Above => region.as_range().end,
    };
  }

  /// Steps one page further after yielding a site, so repeated calls
  /// keep making progress through a large gap.
  fn step_page(&mut self) {
    let page_size = region::page::size();
    self.cursor = match self.search {
      SearchDirection::Below => self.cursor.saturating_sub(page_size),
      SearchDirection::Above => self.cursor + page_size,
    };
  }
}

impl Iterator for PoolSiteIter {
  type Item = Result<*const ()>;

  fn next(&mut self) -> Option<Self::Item> {
    while self.cursor > 0 && self.range.contains(&self.cursor) {
      match region::query(self.cursor as *const u8) {
        Ok(region) => self.skip_region(&region),
        Err(region::Error::UnmappedRegion) => {
          // Pool bases must stay word aligned for the literal pools
          // the slices will carry; rounding up keeps the site inside
          // the gap
          let site = (self.cursor + 3) & !3;
          self.step_page();
          return Some(Ok(site as *const _));
        },
        Err(error) => {
          self.step_page();
          return Some(Err(Error::RegionFailure(error)));
        },
      }
    }

    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sites_are_aligned_and_within_reach() {
    let origin = sites_are_aligned_and_within_reach as *const ();
    let range = (origin as usize).saturating_sub(0x0100_0000)
      ..(origin as usize).saturating_add(0x0100_0000);

    let sites: Vec<usize> = pool_sites(origin, range.clone())
      .take(4)
      .filter_map(|site| site.ok())
      .map(|site| site as usize)
      .collect();

    assert!(!sites.is_empty());
    for site in sites {
      assert_eq!(site % 4, 0);
      assert!(range.contains(&site));
    }
  }
}
