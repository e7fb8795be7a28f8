use std::collections::HashMap;

use async_trait::async_trait;
use batchload_rs::{BatchFunction, BatchResult, LoadError, Loader};

// Empty functor that implements the BatchFunction trait. For this example, it
// trivially loads values from some HashMap.
struct MyBatchFn;

#[async_trait]
impl BatchFunction for MyBatchFn {
    type Key = i64;
    type Value = String;
    type Context = HashMap<i64, String>;

    async fn load(keys: &[i64], context: &Self::Context) -> BatchResult<i64, String> {
        Ok(keys.iter().filter_map(|k| context.get(k).cloned().map(|v| (*k, Ok(v)))).collect())
    }
}

#[tokio::main]
async fn main() {
    let mut context = HashMap::new();
    context.insert(2001, "a space odyssey".to_owned());
    context.insert(7, "samurai".to_owned());
    context.insert(12, "angry men".to_owned());

    let loader = Loader::new(MyBatchFn {}, context);

    assert_eq!(loader.load(7).await.as_deref(), Ok("samurai"));
    assert!(matches!(loader.load(15).await, Err(LoadError::KeyNotFound { .. })));

    assert_eq!(
        loader
            .load_many(vec![12, 2010, 2001])
            .await
            .iter()
            .map(|v| v.as_deref().ok())
            .collect::<Vec<_>>(),
        vec![Some("angry men"), None, Some("a space odyssey")]
    );
}
