use crate::peer::types::IceCandidate;
use std::collections::VecDeque;
use tracing::{info, warn};

/// Кандидаты, полученные до установки remote description.
/// Отдаются строго в порядке прихода.
#[derive(Debug)]
pub struct CandidateQueue {
    items: VecDeque<IceCandidate>,
    limit: usize,
}

impl CandidateQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            items: VecDeque::new(),
            limit,
        }
    }

    /// false, если очередь переполнена и кандидат отброшен
    pub fn push(&mut self, candidate: IceCandidate) -> bool {
        if self.items.len() >= self.limit {
            return false;
        }
        self.items.push_back(candidate);
        true
    }

    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
    Unknown,
}

impl CandidateType {
    pub fn of(candidate: &str) -> Self {
        let mut parts = candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return match parts.next() {
                    Some("host") => CandidateType::Host,
                    Some("srflx") => CandidateType::Srflx,
                    Some("prflx") => CandidateType::Prflx,
                    Some("relay") => CandidateType::Relay,
                    _ => CandidateType::Unknown,
                };
            }
        }
        CandidateType::Unknown
    }
}

/// Сводка по собранным локальным кандидатам
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateSummary {
    pub fn record(&mut self, candidate: &IceCandidate) {
        match CandidateType::of(&candidate.candidate) {
            CandidateType::Host => self.host += 1,
            CandidateType::Srflx => self.srflx += 1,
            CandidateType::Relay => self.relay += 1,
            CandidateType::Prflx | CandidateType::Unknown => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    pub fn log(&self, peer_id: &str) {
        info!(
            peer_id,
            host = self.host,
            srflx = self.srflx,
            relay = self.relay,
            "candidate analysis"
        );
        if self.relay == 0 {
            warn!(peer_id, "no TURN relay candidates found, connection through NAT may fail");
        }
    }
}

impl<'a> FromIterator<&'a IceCandidate> for CandidateSummary {
    fn from_iter<I: IntoIterator<Item = &'a IceCandidate>>(iter: I) -> Self {
        let mut summary = CandidateSummary::default();
        for candidate in iter {
            summary.record(candidate);
        }
        summary
    }
}
