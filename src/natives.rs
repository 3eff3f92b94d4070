use super::value::{NativeFn, Value};
use rand::prelude::*;
use std::time::{SystemTime, UNIX_EPOCH};

pub const NATIVES: [(&str, NativeFn); 2] = [("clock", clock), ("random", random)];

pub fn clock(_args: &[Value]) -> Value {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Value::Number(elapsed.as_secs_f64())
}

pub fn random(_args: &[Value]) -> Value {
    let mut rng = rand::thread_rng();
    Value::Number(rng.gen::<f64>())
}
