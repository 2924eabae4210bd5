use std::collections::VecDeque;

use crate::client::messages::IncomingCallOffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Surface,
    Queued,
    Duplicate,
    Overflow,
}

#[derive(Debug)]
pub struct AdmissionQueue {
    current: Option<IncomingCallOffer>,
    queued: VecDeque<IncomingCallOffer>,
    capacity: usize,
    seq: u64,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            current: None,
            queued: VecDeque::with_capacity(capacity),
            capacity,
            seq: 0,
        }
    }

    pub fn admit(&mut self, offer: IncomingCallOffer) -> Admission {
        if self.contains(&offer.call_id) {
            return Admission::Duplicate;
        }
        if self.len() >= self.capacity {
            return Admission::Overflow;
        }
        if self.current.is_none() && self.queued.is_empty() {
            self.current = Some(offer);
            self.seq += 1;
            return Admission::Surface;
        }
        self.queued.push_back(offer);
        Admission::Queued
    }

    pub fn len(&self) -> usize {
        self.current.is_some() as usize + self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.current.as_ref().is_some_and(|o| o.call_id == call_id)
            || self.queued.iter().any(|o| o.call_id == call_id)
    }

    pub fn current(&self) -> Option<&IncomingCallOffer> {
        self.current.as_ref()
    }

    pub fn queued(&self) -> impl Iterator<Item = &IncomingCallOffer> {
        self.queued.iter()
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn take_current(&mut self) -> Option<IncomingCallOffer> {
        self.current.take()
    }

    pub fn promote(&mut self) -> Option<&IncomingCallOffer> {
        if self.current.is_none() {
            if let Some(next) = self.queued.pop_front() {
                self.current = Some(next);
                self.seq += 1;
                return self.current.as_ref();
            }
        }
        None
    }

    pub fn withdraw(&mut self, call_id: &str) -> Option<bool> {
        if self.current.as_ref().is_some_and(|o| o.call_id == call_id) {
            self.current = None;
            return Some(true);
        }
        let before = self.queued.len();
        self.queued.retain(|o| o.call_id != call_id);
        (self.queued.len() != before).then_some(false)
    }
}
