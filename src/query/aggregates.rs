use super::descriptor::AggregateOp;
use crate::data::Value;

/// Separator used by CONCAT
pub const CONCAT_SEPARATOR: &str = ",";

/// Accumulator trait for aggregation functions
pub trait Accumulator: Send + Sync {
    /// Add a value to the accumulator
    fn accumulate(&mut self, value: &Value);

    /// Get the final result
    fn result(&self) -> Value;
}

/// COUNT(*) or COUNT(column)
#[derive(Debug, Clone)]
pub struct CountAccumulator {
    count: i64,
    count_nulls: bool, // COUNT(*) counts nulls, COUNT(col) doesn't
}

impl CountAccumulator {
    pub fn new(count_nulls: bool) -> Self {
        Self {
            count: 0,
            count_nulls,
        }
    }
}

impl Accumulator for CountAccumulator {
    fn accumulate(&mut self, value: &Value) {
        if self.count_nulls || !value.is_null() {
            self.count += 1;
        }
    }

    fn result(&self) -> Value {
        Value::Int64(self.count)
    }
}

/// SUM(column); stays integral while every input is
#[derive(Debug, Clone, Default)]
pub struct SumAccumulator {
    int_sum: i64,
    float_sum: f64,
    integral: bool,
    has_value: bool,
}

impl SumAccumulator {
    pub fn new() -> Self {
        Self {
            integral: true,
            ..Default::default()
        }
    }
}

impl Accumulator for SumAccumulator {
    fn accumulate(&mut self, value: &Value) {
        match value {
            Value::Int64(v) | Value::Timestamp(v) => {
                self.int_sum = self.int_sum.saturating_add(*v);
                self.float_sum += *v as f64;
                self.has_value = true;
            }
            Value::Float64(v) => {
                self.float_sum += v;
                self.integral = false;
                self.has_value = true;
            }
            _ => {}
        }
    }

    fn result(&self) -> Value {
        if !self.has_value {
            Value::Null
        } else if self.integral {
            Value::Int64(self.int_sum)
        } else {
            Value::Float64(self.float_sum)
        }
    }
}

/// AVG(column)
#[derive(Debug, Clone, Default)]
pub struct AvgAccumulator {
    sum: f64,
    count: i64,
}

impl Accumulator for AvgAccumulator {
    fn accumulate(&mut self, value: &Value) {
        if let Some(v) = value.as_f64() {
            self.sum += v;
            self.count += 1;
        }
    }

    fn result(&self) -> Value {
        if self.count > 0 {
            Value::Float64(self.sum / self.count as f64)
        } else {
            Value::Null
        }
    }
}

/// MIN(column)
#[derive(Debug, Clone, Default)]
pub struct MinAccumulator {
    min: Option<Value>,
}

impl Accumulator for MinAccumulator {
    fn accumulate(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        match &self.min {
            Some(current) if value >= current => {}
            _ => self.min = Some(value.clone()),
        }
    }

    fn result(&self) -> Value {
        self.min.clone().unwrap_or(Value::Null)
    }
}

/// MAX(column)
#[derive(Debug, Clone, Default)]
pub struct MaxAccumulator {
    max: Option<Value>,
}

impl Accumulator for MaxAccumulator {
    fn accumulate(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        match &self.max {
            Some(current) if value <= current => {}
            _ => self.max = Some(value.clone()),
        }
    }

    fn result(&self) -> Value {
        self.max.clone().unwrap_or(Value::Null)
    }
}

/// CONCAT(column): non-null values joined in input order
#[derive(Debug, Clone, Default)]
pub struct ConcatAccumulator {
    parts: Vec<String>,
}

impl Accumulator for ConcatAccumulator {
    fn accumulate(&mut self, value: &Value) {
        if !value.is_null() {
            self.parts.push(value.to_string());
        }
    }

    fn result(&self) -> Value {
        if self.parts.is_empty() {
            Value::Null
        } else {
            Value::String(self.parts.join(CONCAT_SEPARATOR))
        }
    }
}

/// Create an accumulator for an operation; `column = None` means every row counts
pub fn create_accumulator(op: AggregateOp, column: Option<&str>) -> Box<dyn Accumulator> {
    match op {
        AggregateOp::Count => Box::new(CountAccumulator::new(column.is_none())),
        AggregateOp::Sum => Box::new(SumAccumulator::new()),
        AggregateOp::Avg => Box::new(AvgAccumulator::default()),
        AggregateOp::Min => Box::new(MinAccumulator::default()),
        AggregateOp::Max => Box::new(MaxAccumulator::default()),
        AggregateOp::Concat => Box::new(ConcatAccumulator::default()),
    }
}
