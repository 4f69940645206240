#![forbid(unsafe_code)]

use std::ops::Range;

use crate::chain::ChainError;
use crate::link::{ChainLink, LinkType};
use crate::{Kid, SigId};

/// Six accounts reused their eldest key after a reset, without an
/// `eldest` marker, before the server prohibited it. Their chains carry
/// no visible reset, so the reset links are pinned here by sig id.
const HARDCODED_RESETS: [&str; 6] = [
    "11111487aa193b9fafc92851176803af8ed005983cad1eaf5d6a49a459b8fffe0f",
    "df0005f6c61bd6efd2867b320013800781f7f047e83fd44d484c2cb2616f019f0f",
    "32eab86aa31796db3200f42f2553d330b8a68931544bbb98452a80ad2b0003d30f",
    "5ed7a3356fd0f759a4498fc6fed1dca7f62611eb14f782a2a9cda1b836c58db50f",
    "d5fe2c5e31958fe45a7f42b325375d5bd8916ef757f736a6faaa66a6b18bec780f",
    "1e116e81bc08b915d9df93dc35c202a75ead36c479327cdf49a15f3768ac58f80f",
];

/// Whether a sig id belongs to the hardcoded reset set.
#[must_use]
pub fn is_hardcoded_reset(sig_id: &SigId) -> bool {
    HARDCODED_RESETS.contains(&sig_id.as_str())
}

/// Whether `curr` starts a new subchain relative to its predecessor.
///
/// Four cases mark a start: the very first link; an explicit `eldest`
/// link; a v1→v1 pair whose eldest keys differ (the old reset encoding);
/// or membership in the hardcoded set. The eldest-kid comparison only
/// applies when both links are v1: stubbed v2 links would break it, and
/// every affected signature long predates v2.
#[must_use]
pub fn is_subchain_start(curr: &ChainLink, prev: &ChainLink) -> bool {
    if curr.seqno() == 1 {
        return true;
    }
    if matches!(curr.link_type(), LinkType::Eldest) {
        return true;
    }
    if curr.sig_version() > 1 || prev.sig_version() > 1 {
        return false;
    }
    if curr.to_eldest_kid() != prev.to_eldest_kid() {
        return true;
    }
    is_hardcoded_reset(curr.sig_id())
}

/// Crops a link list to the suffix forming the current subchain under
/// `eldest`. An empty range means the user is new or just reset. The
/// final link must arrive inflated so its eldest kid is readable.
pub fn crop_to_rightmost_subchain(
    links: &[ChainLink],
    eldest: &Kid,
) -> Result<Range<usize>, ChainError> {
    let Some(last) = links.last() else {
        return Ok(0..0);
    };
    if last.is_stubbed() {
        return Err(ChainError::StubbedFinalLink);
    }
    // An eldest mismatch at the tail means the account reset after its
    // last link: no current subchain.
    if last.to_eldest_kid() != Some(eldest) {
        return Ok(links.len()..links.len());
    }
    for i in (1..links.len()).rev() {
        if is_subchain_start(&links[i], &links[i - 1]) {
            return Ok(i..links.len());
        }
    }
    // No start in the middle: the whole chain is one subchain, which is
    // only coherent if we really loaded back to the first link.
    if links[0].seqno() != 1 {
        return Err(ChainError::Internal {
            reason: "chain ended before seqno 1 while cropping subchain",
        });
    }
    Ok(0..links.len())
}
