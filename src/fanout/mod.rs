//! Bounded parallel dispatch and photo-set merging.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use crate::normalizer::{PhotoKind, PhotoRef};

/// Run `task` over every item with at most `max_concurrency` in flight.
///
/// Each task is individually timed out. Failures and timeouts are dropped;
/// the surviving results keep the order of `items`.
pub async fn fan_out<I, T, R, E, F, Fut>(
    items: I,
    task: F,
    max_concurrency: usize,
    per_task_timeout: Duration,
) -> Vec<R>
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: std::fmt::Display,
{
    stream::iter(items)
        .map(|item| {
            let fut = task(item);
            async move { tokio::time::timeout(per_task_timeout, fut).await }
        })
        .buffered(max_concurrency.max(1))
        .filter_map(|outcome| async move {
            match outcome {
                Ok(Ok(value)) => Some(value),
                Ok(Err(err)) => {
                    log::debug!("fan-out task failed: {err}");
                    None
                }
                Err(_) => {
                    log::debug!("fan-out task timed out after {:?}", per_task_timeout);
                    None
                }
            }
        })
        .collect()
        .await
}

/// Outcome of one logical photo sub-query.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupOutcome {
    Photos { kind: PhotoKind, urls: Vec<String> },
    /// Access to the identity as a whole is restricted.
    Restricted { reason: String },
}

/// One labelled photo source, in the order it was requested.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoGroup {
    pub label: String,
    pub outcome: GroupOutcome,
}

impl PhotoGroup {
    pub fn current(label: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            label: label.into(),
            outcome: GroupOutcome::Photos {
                kind: PhotoKind::Current,
                urls,
            },
        }
    }

    pub fn history(label: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            label: label.into(),
            outcome: GroupOutcome::Photos {
                kind: PhotoKind::History,
                urls,
            },
        }
    }

    pub fn restricted(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            outcome: GroupOutcome::Restricted {
                reason: reason.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergedPhotos {
    Photos(Vec<PhotoRef>),
    Restricted { reason: String },
}

/// Merge photo groups: concatenate in group order, drop repeated URLs
/// (first occurrence keeps its place, a current copy upgrades it), keep a
/// single current photo at position 0 and number the rest sequentially. A
/// restricted group wins over everything.
pub fn merge_photo_groups(groups: Vec<PhotoGroup>) -> MergedPhotos {
    let mut merged: Vec<PhotoRef> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for group in groups {
        match group.outcome {
            GroupOutcome::Restricted { reason } => {
                return MergedPhotos::Restricted {
                    reason: format!("{}: {}", group.label, reason),
                };
            }
            GroupOutcome::Photos { kind, urls } => {
                for url in urls {
                    let url = url.trim().to_string();
                    if url.is_empty() {
                        continue;
                    }
                    if let Some(&idx) = seen.get(&url) {
                        if kind == PhotoKind::Current {
                            merged[idx].kind = PhotoKind::Current;
                        }
                        continue;
                    }
                    seen.insert(url.clone(), merged.len());
                    merged.push(PhotoRef {
                        url,
                        kind,
                        position: 0,
                    });
                }
            }
        }
    }

    if let Some(idx) = merged.iter().position(|p| p.kind == PhotoKind::Current) {
        let current = merged.remove(idx);
        merged.insert(0, current);
    }
    for (position, photo) in merged.iter_mut().enumerate() {
        if position > 0 && photo.kind == PhotoKind::Current {
            photo.kind = PhotoKind::History;
        }
        photo.position = position;
    }
    MergedPhotos::Photos(merged)
}
