/// Bounded pool of concurrency slots.
///
/// Slots are abstract units rather than threads; acquiring one is the
/// admission decision and releasing it happens exactly once per acquisition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlotBudget {
    capacity: u32,
    in_use: u32,
    peak: u32,
}

impl SlotBudget {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            in_use: 0,
            peak: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    /// Highest `in_use` ever observed.
    pub fn peak(&self) -> u32 {
        self.peak
    }

    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.in_use)
    }

    pub fn is_full(&self) -> bool {
        self.in_use >= self.capacity
    }

    /// Returns `true` if a slot was free and is now taken.
    pub fn try_acquire(&mut self) -> bool {
        if self.is_full() {
            return false;
        }
        self.in_use += 1;
        self.peak = self.peak.max(self.in_use);
        true
    }

    /// Returns `false` if no slot was held, which indicates a double release.
    pub fn release(&mut self) -> bool {
        if self.in_use == 0 {
            return false;
        }
        self.in_use -= 1;
        true
    }
}
