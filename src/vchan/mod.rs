//! Virtual-channel transforms: measurements that synthesize tags and
//! inject them back into the stream ahead of downstream consumers.

pub mod coincidence;
pub mod combiner;
pub mod delayed;
pub mod gated;

use crate::stream::tag::Tag;

/// Merges time-sorted emissions into a time-sorted block, keeping original
/// tags ahead of emissions at equal timestamps.
pub(crate) fn merge_emissions(tags: &mut Vec<Tag>, emissions: Vec<Tag>) {
    if emissions.is_empty() {
        return;
    }

    debug_assert!(emissions.windows(2).all(|w| w[0].time_ps <= w[1].time_ps));

    let mut merged = Vec::with_capacity(tags.len() + emissions.len());
    let mut emitted = emissions.into_iter().peekable();

    for tag in tags.drain(..) {
        while let Some(e) = emitted.peek() {
            if e.time_ps < tag.time_ps {
                merged.push(*e);
                emitted.next();
            } else {
                break;
            }
        }
        merged.push(tag);
    }
    merged.extend(emitted);

    *tags = merged;
}
