//! Per-topic shared-memory segment pool.
//!
//! The pool owns every segment used for zero-copy topic payloads and
//! enforces the hand-off discipline between the single publisher and a
//! rotating set of subscribers per topic:
//!
//! - a segment only becomes the topic's **latest** once the writer has
//!   finished with it ([`ShmemPool::done_with_pub_shmem`]), so a
//!   subscriber can never observe a half-written segment;
//! - a segment is only reused as the next publish target when it is
//!   neither the latest nor currently held by any subscriber.
//!
//! Segment names follow `"{topic}_{seq}"`; the sequence number is
//! assigned at first creation and stable for the run.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, error, info, warn};

use crate::error::{ShmError, ShmResult};
use crate::segment::ShmSegment;

/// Publication bookkeeping of one topic.
#[derive(Debug, Default)]
pub struct ShmemPubStatus {
    /// Names of all allocated segments of the topic.
    pub names: BTreeSet<String>,
    /// Most recently published segment. Empty until the first publish
    /// completes.
    pub latest: String,
    /// Segment currently being written. Empty outside a publish window.
    pub publishing: String,
}

/// Subscription bookkeeping of one topic: which modules currently hold
/// which segment mapped.
#[derive(Debug, Default)]
pub struct ShmemSubStatus {
    holders: HashMap<String, HashSet<String>>,
}

impl ShmemSubStatus {
    fn is_held(&self, segment: &str) -> bool {
        self.holders.get(segment).is_some_and(|m| !m.is_empty())
    }

    fn hold(&mut self, segment: &str, module: &str) {
        self.holders.entry(segment.to_string()).or_default().insert(module.to_string());
    }

    fn release(&mut self, module: &str) {
        self.holders.retain(|_, modules| {
            modules.remove(module);
            !modules.is_empty()
        });
    }

    fn clear(&mut self) {
        self.holders.clear();
    }
}

#[derive(Debug, Default)]
struct TopicPool {
    byte_size: usize,
    segments: HashMap<String, ShmSegment>,
    pub_status: ShmemPubStatus,
    sub_status: ShmemSubStatus,
}

/// Allocator and tracker for named shared-memory segments keyed by topic.
///
/// Not thread-safe: the pool is owned exclusively by the coordinator's
/// command-executing thread.
#[derive(Debug, Default)]
pub struct ShmemPool {
    /// Publish sizes declared since the last reconciliation.
    declared: HashMap<String, usize>,
    topics: HashMap<String, TopicPool>,
    /// Sequence counters survive topic rebuilds so a name is never
    /// reissued while a stuck segment may still linger in the OS.
    seq_counters: HashMap<String, u32>,
}

impl ShmemPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a declared publish size for `topic`. Multiple publishers
    /// declaring the same topic keep the largest size.
    pub fn add_shmem_pub_info(&mut self, topic: &str, byte_size: usize) {
        let entry = self.declared.entry(topic.to_string()).or_insert(0);
        *entry = (*entry).max(byte_size);
        debug!(topic, byte_size, "declared shmem publication");
    }

    /// Reconcile the materialized pool against the declarations made
    /// since the last call.
    ///
    /// Topics no longer declared, or declared with a different size,
    /// have all their segments destroyed and are rebuilt fresh.
    /// Per-segment removal failures are logged and tolerated, but fail
    /// the whole call once everything else has been reconciled.
    /// Unchanged topics keep their segments but clear the transient
    /// publish/subscribe bookkeeping.
    pub fn update_shmem_pubs(&mut self) -> ShmResult<()> {
        let declared = std::mem::take(&mut self.declared);
        let mut removal_failure: Option<ShmError> = None;

        let stale: Vec<String> = self
            .topics
            .iter()
            .filter(|(topic, pool)| declared.get(*topic) != Some(&pool.byte_size))
            .map(|(topic, _)| topic.clone())
            .collect();

        for topic in stale {
            let Some(pool) = self.topics.remove(&topic) else { continue };
            let mut failed = 0usize;
            for (name, segment) in pool.segments {
                if let Err(e) = segment.destroy() {
                    error!(topic = %topic, segment = %name, "segment removal failed: {e}");
                    failed += 1;
                }
            }
            if failed > 0 {
                removal_failure = Some(ShmError::RemovalFailed { topic: topic.clone(), failed });
            } else {
                info!(topic = %topic, "stale shmem topic destroyed");
            }
        }

        for (topic, byte_size) in declared {
            let pool = self.topics.entry(topic).or_default();
            pool.byte_size = byte_size;
            pool.pub_status.latest.clear();
            pool.pub_status.publishing.clear();
            pool.sub_status.clear();
        }

        match removal_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Hand out a segment for the next publish of `topic` and mark it
    /// as being written.
    ///
    /// Reuses an existing segment that is neither the latest-published
    /// one nor held by any subscriber; allocates a fresh
    /// `"{topic}_{seq}"` segment otherwise.
    pub fn get_pub_shmem_name(&mut self, topic: &str) -> ShmResult<String> {
        let pool = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| ShmError::UnknownTopic { topic: topic.to_string() })?;

        let reusable = pool
            .pub_status
            .names
            .iter()
            .find(|n| n.as_str() != pool.pub_status.latest && !pool.sub_status.is_held(n))
            .cloned();

        let name = match reusable {
            Some(name) => name,
            None => {
                let seq = self.seq_counters.entry(topic.to_string()).or_insert(0);
                let name = format!("{topic}_{seq}");
                *seq += 1;
                let segment = ShmSegment::create(&name, pool.byte_size)?;
                info!(topic, segment = %name, size = pool.byte_size, "allocated shmem segment");
                pool.segments.insert(name.clone(), segment);
                pool.pub_status.names.insert(name.clone());
                name
            }
        };

        pool.pub_status.publishing = name.clone();
        Ok(name)
    }

    /// Promote the segment being written to the topic's latest.
    pub fn done_with_pub_shmem(&mut self, topic: &str) -> ShmResult<()> {
        let pool = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| ShmError::UnknownTopic { topic: topic.to_string() })?;
        if pool.pub_status.publishing.is_empty() {
            warn!(topic, "done_with_pub_shmem without a pending publish");
            return Ok(());
        }
        pool.pub_status.latest = std::mem::take(&mut pool.pub_status.publishing);
        Ok(())
    }

    /// Hand out the topic's latest segment to `module` and record the
    /// hold. Returns an empty string when nothing has been published
    /// yet (including topics with no publisher at all).
    pub fn get_sub_shmem_name(&mut self, topic: &str, module: &str) -> String {
        let Some(pool) = self.topics.get_mut(topic) else {
            return String::new();
        };
        if pool.pub_status.latest.is_empty() {
            return String::new();
        }
        let latest = pool.pub_status.latest.clone();
        pool.sub_status.hold(&latest, module);
        latest
    }

    /// Release the segment `module` holds for `topic`.
    pub fn done_with_sub_shmem(&mut self, topic: &str, module: &str) {
        if let Some(pool) = self.topics.get_mut(topic) {
            pool.sub_status.release(module);
        }
    }

    /// Names of the currently allocated segments of `topic`, sorted.
    pub fn topic_segment_names(&self, topic: &str) -> Vec<String> {
        self.topics
            .get(topic)
            .map(|p| p.pub_status.names.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Drop for ShmemPool {
    /// Dropping the pool removes every segment from the OS.
    fn drop(&mut self) {
        for (topic, pool) in self.topics.drain() {
            for (name, segment) in pool.segments {
                if let Err(e) = segment.destroy() {
                    error!(topic = %topic, segment = %name, "segment removal on drop failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_topic(tag: &str) -> String {
        format!("simco_pool_{}_{}", tag, std::process::id())
    }

    #[test]
    fn publish_then_subscribe_roundtrip() {
        let topic = unique_topic("rt");
        let mut pool = ShmemPool::new();
        pool.add_shmem_pub_info(&topic, 256);
        pool.update_shmem_pubs().unwrap();

        let published = pool.get_pub_shmem_name(&topic).unwrap();
        assert_eq!(published, format!("{topic}_0"));
        // Not yet promoted: subscribers see nothing.
        assert_eq!(pool.get_sub_shmem_name(&topic, "viewer"), "");

        pool.done_with_pub_shmem(&topic).unwrap();
        assert_eq!(pool.get_sub_shmem_name(&topic, "viewer"), published);
    }

    #[test]
    fn held_and_latest_segments_are_not_reused() {
        let topic = unique_topic("reuse");
        let mut pool = ShmemPool::new();
        pool.add_shmem_pub_info(&topic, 128);
        pool.update_shmem_pubs().unwrap();

        let s0 = pool.get_pub_shmem_name(&topic).unwrap();
        pool.done_with_pub_shmem(&topic).unwrap();
        let held = pool.get_sub_shmem_name(&topic, "viewer");
        assert_eq!(held, s0);

        // s0 is latest and held: the next publish target must differ.
        let s1 = pool.get_pub_shmem_name(&topic).unwrap();
        assert_ne!(s1, s0);
        pool.done_with_pub_shmem(&topic).unwrap();

        // s0 is still held, s1 is latest: a third segment is allocated.
        let s2 = pool.get_pub_shmem_name(&topic).unwrap();
        assert_ne!(s2, s0);
        assert_ne!(s2, s1);
        pool.done_with_pub_shmem(&topic).unwrap();

        // Once the hold is released, s0 rotates back in.
        pool.done_with_sub_shmem(&topic, "viewer");
        let s3 = pool.get_pub_shmem_name(&topic).unwrap();
        assert_eq!(s3, s0);
    }

    #[test]
    fn unchanged_size_keeps_segment_names() {
        let topic = unique_topic("idem");
        let mut pool = ShmemPool::new();
        pool.add_shmem_pub_info(&topic, 512);
        pool.update_shmem_pubs().unwrap();
        let name = pool.get_pub_shmem_name(&topic).unwrap();
        pool.done_with_pub_shmem(&topic).unwrap();

        // Re-declare with the same size: segments survive, transient
        // bookkeeping resets.
        pool.add_shmem_pub_info(&topic, 512);
        pool.update_shmem_pubs().unwrap();
        assert_eq!(pool.topic_segment_names(&topic), vec![name.clone()]);
        assert_eq!(pool.get_sub_shmem_name(&topic, "viewer"), "");
        assert_eq!(pool.get_pub_shmem_name(&topic).unwrap(), name);
    }

    #[test]
    fn resized_topic_is_rebuilt() {
        let topic = unique_topic("resize");
        let mut pool = ShmemPool::new();
        pool.add_shmem_pub_info(&topic, 128);
        pool.update_shmem_pubs().unwrap();
        let old = pool.get_pub_shmem_name(&topic).unwrap();

        pool.add_shmem_pub_info(&topic, 4096);
        pool.update_shmem_pubs().unwrap();
        assert!(pool.topic_segment_names(&topic).is_empty());

        let fresh = pool.get_pub_shmem_name(&topic).unwrap();
        // The sequence counter survives the rebuild.
        assert_ne!(fresh, old);
        assert!(
            ShmSegment::attach(&old).is_err(),
            "resized topic must not leave old segments behind"
        );
    }

    #[test]
    fn undeclared_topic_is_destroyed() {
        let topic = unique_topic("gone");
        let mut pool = ShmemPool::new();
        pool.add_shmem_pub_info(&topic, 64);
        pool.update_shmem_pubs().unwrap();
        let name = pool.get_pub_shmem_name(&topic).unwrap();

        // Next reconciliation without the topic declared removes it.
        pool.update_shmem_pubs().unwrap();
        assert!(pool.get_pub_shmem_name(&topic).is_err());
        assert!(ShmSegment::attach(&name).is_err());
    }

    #[test]
    fn publish_to_unknown_topic_fails() {
        let mut pool = ShmemPool::new();
        assert!(matches!(
            pool.get_pub_shmem_name("never_declared"),
            Err(ShmError::UnknownTopic { .. })
        ));
    }

    #[test]
    fn drop_unlinks_segments() {
        let topic = unique_topic("drop");
        let name;
        {
            let mut pool = ShmemPool::new();
            pool.add_shmem_pub_info(&topic, 64);
            pool.update_shmem_pubs().unwrap();
            name = pool.get_pub_shmem_name(&topic).unwrap();
            assert!(ShmSegment::attach(&name).is_ok());
        }
        assert!(ShmSegment::attach(&name).is_err());
    }
}
