// Bounded top-N latency sketch.

/// Keeps the `capacity` largest samples seen, sorted ascending, plus the
/// exact minimum and maximum of everything pushed.
///
/// Not synchronized; callers share it behind a mutex.
///
/// ```
/// use lossprobe_engine::LatencySketch;
///
/// let mut sketch = LatencySketch::new(3);
/// for value in [5, 1, 9, 7] {
///     sketch.push(value);
/// }
/// assert_eq!(sketch.values(), &[5, 7, 9]);
/// assert_eq!(sketch.min(), Some(1));
/// assert_eq!(sketch.max(), Some(9));
/// ```
#[derive(Debug, Clone, Default)]
pub struct LatencySketch {
    capacity: usize,
    values: Vec<u32>,
    min: Option<u32>,
    max: Option<u32>,
}

impl LatencySketch {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            values: Vec::with_capacity(capacity),
            min: None,
            max: None,
        }
    }

    pub fn push(&mut self, value: u32) {
        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
        if self.values.len() < self.capacity {
            self.insert_sorted(value);
        } else if self.values.first().is_some_and(|smallest| value > *smallest) {
            self.values.remove(0);
            self.insert_sorted(value);
        }
    }

    fn insert_sorted(&mut self, value: u32) {
        let idx = self.values.partition_point(|v| *v <= value);
        self.values.insert(idx, value);
    }

    /// Smallest value ever pushed, retained or not.
    pub fn min(&self) -> Option<u32> {
        self.min
    }

    pub fn max(&self) -> Option<u32> {
        self.max
    }

    /// Remove and return the largest retained value.
    pub fn pop(&mut self) -> Option<u32> {
        self.values.pop()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Retained values, ascending.
    pub fn values(&self) -> &[u32] {
        &self.values
    }
}
