pub mod record;
pub mod value;

pub use record::{
    approx_records_size, get_path, record_from_json, record_to_json, set_path, sort_records, value_at, Record,
};
pub use value::{DataType, Value};
