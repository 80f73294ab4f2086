use gridtrade_core::FillEvent;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Min-heap of fills keyed by exchange timestamp, so fills drained within a
/// tick are always processed in exchange order regardless of stream
/// arrival order. Ties break on trade id for determinism.
#[derive(Default)]
pub struct FillQueue {
    heap: BinaryHeap<QueuedFill>,
}

struct QueuedFill(FillEvent);

impl PartialEq for QueuedFill {
    fn eq(&self, other: &Self) -> bool {
        self.0.timestamp == other.0.timestamp && self.0.trade_id == other.0.trade_id
    }
}

impl Eq for QueuedFill {}

impl PartialOrd for QueuedFill {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedFill {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the oldest fill first.
        (other.0.timestamp, &other.0.trade_id).cmp(&(self.0.timestamp, &self.0.trade_id))
    }
}

impl FillQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fill: FillEvent) {
        self.heap.push(QueuedFill(fill));
    }

    pub fn pop(&mut self) -> Option<FillEvent> {
        self.heap.pop().map(|q| q.0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use gridtrade_core::Side;
    use rust_decimal::Decimal;

    fn fill(trade_id: &str, offset_secs: i64) -> FillEvent {
        FillEvent {
            trade_id: trade_id.to_string(),
            order_id: "o".to_string(),
            market_id: "BTC-USD".to_string(),
            side: Side::Buy,
            price: Decimal::ONE,
            size: Decimal::ONE,
            fee: Decimal::ZERO,
            timestamp: Utc::now() + Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn pops_in_timestamp_order_regardless_of_push_order() {
        let mut queue = FillQueue::new();
        queue.push(fill("c", 30));
        queue.push(fill("a", 10));
        queue.push(fill("b", 20));

        assert_eq!(queue.pop().unwrap().trade_id, "a");
        assert_eq!(queue.pop().unwrap().trade_id, "b");
        assert_eq!(queue.pop().unwrap().trade_id, "c");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn equal_timestamps_break_ties_on_trade_id() {
        let ts = Utc::now();
        let mut queue = FillQueue::new();
        for id in ["t2", "t1", "t3"] {
            let mut f = fill(id, 0);
            f.timestamp = ts;
            queue.push(f);
        }
        assert_eq!(queue.pop().unwrap().trade_id, "t1");
        assert_eq!(queue.pop().unwrap().trade_id, "t2");
        assert_eq!(queue.pop().unwrap().trade_id, "t3");
    }
}
