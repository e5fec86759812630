//! These tests pin down the failure behavior: which errors stay contained
//! to one key, which ones fail a whole batch, and how failures interact
//! with the cache.

use batchcache::{Environment, LoadError, Loader, LoaderOptions};
use futures::executor;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_wrong_length_reply_fails_the_whole_batch() {
    async fn short_reply(
        keys: Vec<i32>,
        _env: Environment<i32, ()>,
    ) -> Result<Vec<String>, String> {
        let mut values: Vec<String> = keys.iter().map(|key| key.to_string()).collect();
        values.pop();
        Ok(values)
    }

    let loader = Loader::new(short_reply);

    let fut1 = loader.load(1);
    let fut2 = loader.load(2);
    executor::block_on(loader.dispatch());

    // Positions can't be trusted, so even the keys that "have" a value in
    // the truncated reply fail.
    let expected = LoadError::WrongLength {
        expected: 2,
        actual: 1,
    };
    assert_eq!(executor::block_on(fut1), Err(expected.clone()));
    assert_eq!(executor::block_on(fut2), Err(expected));
}

#[test]
fn test_failed_invocation_fails_every_key() {
    async fn boom(_keys: Vec<i32>, _env: Environment<i32, ()>) -> Result<Vec<String>, String> {
        Err("boom".to_string())
    }

    let loader = Loader::new(boom);

    let fut1 = loader.load(1);
    let fut2 = loader.load(2);
    executor::block_on(loader.dispatch());

    assert_eq!(
        executor::block_on(fut1),
        Err(LoadError::Loader("boom".to_string()))
    );
    assert_eq!(
        executor::block_on(fut2),
        Err(LoadError::Loader("boom".to_string()))
    );
}

#[test]
fn test_per_key_errors_leave_siblings_alone() {
    async fn odd_keys_fail(
        keys: Vec<i32>,
        _env: Environment<i32, ()>,
    ) -> Result<Vec<Result<String, String>>, String> {
        Ok(keys
            .iter()
            .map(|key| {
                if key % 2 == 1 {
                    Err(format!("odd: {}", key))
                } else {
                    Ok(key.to_string())
                }
            })
            .collect())
    }

    let loader: Loader<i32, String, String, (), i32, _> = Loader::new(odd_keys_fail);

    let fut1 = loader.load(1);
    let fut2 = loader.load(2);
    let fut3 = loader.load(3);
    executor::block_on(loader.dispatch());

    assert_eq!(
        executor::block_on(fut1),
        Err(LoadError::Loader("odd: 1".to_string()))
    );
    assert_eq!(executor::block_on(fut2).unwrap(), "2");
    assert_eq!(
        executor::block_on(fut3),
        Err(LoadError::Loader("odd: 3".to_string()))
    );
}

#[test]
fn test_missing_key_is_distinct_from_an_empty_value() {
    async fn sparse_map(
        keys: Vec<String>,
        _env: Environment<String, ()>,
    ) -> Result<HashMap<String, String>, String> {
        let mut map = HashMap::new();
        for key in &keys {
            match key.as_str() {
                // dropped on the floor entirely
                "absent" => {}
                // an explicit empty value, which is a real answer
                "empty" => {
                    map.insert(key.clone(), String::new());
                }
                other => {
                    map.insert(key.clone(), format!("value:{}", other));
                }
            }
        }
        Ok(map)
    }

    let loader = Loader::new(sparse_map);

    let fut_present = loader.load("present".to_string());
    let fut_empty = loader.load("empty".to_string());
    let fut_absent = loader.load("absent".to_string());
    executor::block_on(loader.dispatch());

    assert_eq!(executor::block_on(fut_present).unwrap(), "value:present");
    assert_eq!(executor::block_on(fut_empty).unwrap(), "");
    assert_eq!(executor::block_on(fut_absent), Err(LoadError::MissingKey));
}

#[test]
fn test_keyed_reply_with_per_key_errors() {
    async fn keyed_errors(
        keys: Vec<String>,
        _env: Environment<String, ()>,
    ) -> Result<HashMap<String, Result<String, String>>, String> {
        Ok(keys
            .iter()
            .map(|key| {
                let outcome = if key == "bad" {
                    Err("rejected".to_string())
                } else {
                    Ok(format!("value:{}", key))
                };
                (key.clone(), outcome)
            })
            .collect())
    }

    let loader: Loader<String, String, String, (), String, _> = Loader::new(keyed_errors);

    let fut_good = loader.load("good".to_string());
    let fut_bad = loader.load("bad".to_string());
    executor::block_on(loader.dispatch());

    assert_eq!(executor::block_on(fut_good).unwrap(), "value:good");
    assert_eq!(
        executor::block_on(fut_bad),
        Err(LoadError::Loader("rejected".to_string()))
    );
}

#[test]
fn test_failures_stay_cached_until_cleared() {
    let calls = Arc::new(AtomicUsize::new(0));

    let batch_fn = {
        let calls = Arc::clone(&calls);
        move |keys: Vec<i32>, _env: Environment<i32, ()>| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(if call == 0 {
                Err("down".to_string())
            } else {
                Ok(keys.iter().map(|key| key.to_string()).collect::<Vec<String>>())
            })
        }
    };

    let loader = Loader::new(batch_fn);

    let fut = loader.load(1);
    executor::block_on(loader.dispatch());
    assert_eq!(
        executor::block_on(fut),
        Err(LoadError::Loader("down".to_string()))
    );

    // The failure is an outcome like any other: cached, no refetch.
    let cached = loader.load(1);
    assert_eq!(loader.dispatch_depth(), 0);
    assert_eq!(
        executor::block_on(cached),
        Err(LoadError::Loader("down".to_string()))
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Retrying is the caller's decision, expressed by clearing first.
    loader.clear(&1);
    let retried = loader.load(1);
    executor::block_on(loader.dispatch());
    assert_eq!(executor::block_on(retried).unwrap(), "1");
}

#[test]
fn test_batch_failures_are_contained_to_their_slice() {
    async fn third_key_poisons(
        keys: Vec<i32>,
        _env: Environment<i32, ()>,
    ) -> Result<Vec<String>, String> {
        if keys.contains(&3) {
            Err("poisoned".to_string())
        } else {
            Ok(keys.iter().map(|key| key.to_string()).collect())
        }
    }

    let options = LoaderOptions {
        max_batch_size: NonZeroUsize::new(2),
        ..LoaderOptions::default()
    };
    let loader = Loader::with_options(third_key_poisons, options);

    let futs = loader.load_many(vec![1, 2, 3, 4, 5]);
    executor::block_on(loader.dispatch());

    let outcomes: Vec<_> = futs.into_iter().map(executor::block_on).collect();

    // The cycle was sliced into [1, 2], [3, 4], [5]; only the poisoned
    // slice failed, and the one after it still ran.
    assert_eq!(outcomes[0].as_deref().unwrap(), "1");
    assert_eq!(outcomes[1].as_deref().unwrap(), "2");
    assert_eq!(outcomes[2], Err(LoadError::Loader("poisoned".to_string())));
    assert_eq!(outcomes[3], Err(LoadError::Loader("poisoned".to_string())));
    assert_eq!(outcomes[4].as_deref().unwrap(), "5");
}
