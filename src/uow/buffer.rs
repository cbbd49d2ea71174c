use crate::envelope::{Envelope, Message};
use crate::error::Result;

/// Events raised during one unit of work, split by delivery rule.
///
/// Aggregates can own a buffer and hand it to
/// [`UnitOfWork::absorb`](super::UnitOfWork::absorb) when they are saved.
#[derive(Debug, Default, Clone)]
pub struct EventBuffer {
    normal: Vec<Envelope>,
    anyway: Vec<Envelope>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Published only if the unit of work commits.
    pub fn raise<M: Message>(&mut self, event: &M) -> Result<&Envelope> {
        let envelope = Envelope::new(event)?;
        Ok(self.push(envelope))
    }

    /// Published whether the unit of work commits or fails.
    pub fn raise_anyway<M: Message>(&mut self, event: &M) -> Result<&Envelope> {
        let envelope = Envelope::new(event)?;
        Ok(self.push_anyway(envelope))
    }

    pub fn push(&mut self, envelope: Envelope) -> &Envelope {
        self.normal.push(envelope);
        &self.normal[self.normal.len() - 1]
    }

    pub fn push_anyway(&mut self, envelope: Envelope) -> &Envelope {
        self.anyway.push(envelope);
        &self.anyway[self.anyway.len() - 1]
    }

    pub fn normal(&self) -> &[Envelope] {
        &self.normal
    }

    pub fn anyway(&self) -> &[Envelope] {
        &self.anyway
    }

    pub fn len(&self) -> usize {
        self.normal.len() + self.anyway.len()
    }

    pub fn is_empty(&self) -> bool {
        self.normal.is_empty() && self.anyway.is_empty()
    }

    /// Move every event out, leaving the buffer empty.
    pub fn take(&mut self) -> EventBuffer {
        std::mem::take(self)
    }

    pub(crate) fn into_parts(self) -> (Vec<Envelope>, Vec<Envelope>) {
        (self.normal, self.anyway)
    }

    pub(crate) fn for_each_mut(&mut self, f: impl FnMut(&mut Envelope)) {
        self.normal.iter_mut().chain(self.anyway.iter_mut()).for_each(f);
    }
}
