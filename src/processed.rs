use std::collections::{HashSet, VecDeque};

pub const PROCESSED_CAPACITY: usize = 100_000;

#[derive(Debug, Clone)]
pub struct ProcessedIdSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl Default for ProcessedIdSet {
    fn default() -> Self {
        Self::with_capacity(PROCESSED_CAPACITY)
    }
}

impl ProcessedIdSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn from_ids<I>(ids: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut set = Self::with_capacity(capacity);
        for id in ids {
            set.insert(id);
        }
        set
    }

    pub fn insert(&mut self, id: String) -> bool {
        if id.is_empty() || self.members.contains(&id) {
            return false;
        }
        self.members.insert(id.clone());
        self.order.push_back(id);

        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}
