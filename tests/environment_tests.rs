//! These tests ensure the environment reaches the batch function: the
//! configured context is observed by every invocation, the neutral
//! environment reads as unset rather than failing, and the environment is
//! produced at dispatch time.

use batchcache::{Environment, Loader, LoaderOptions};
use futures::executor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn suffix(key: &str, env: &Environment<String, String>) -> String {
    format!(
        "{}-{}",
        key,
        env.context().map(String::as_str).unwrap_or("null")
    )
}

async fn list_loader(
    keys: Vec<String>,
    env: Environment<String, String>,
) -> Result<Vec<String>, ()> {
    Ok(keys.iter().map(|key| suffix(key, &env)).collect())
}

async fn map_loader(
    keys: Vec<String>,
    env: Environment<String, String>,
) -> Result<HashMap<String, String>, ()> {
    Ok(keys
        .iter()
        .map(|key| (key.clone(), suffix(key, &env)))
        .collect())
}

fn key_logger<U, R>(
    log: &Arc<Mutex<Vec<Vec<String>>>>,
    function: impl Clone + Fn(Vec<String>, U) -> R,
) -> impl Clone + Fn(Vec<String>, U) -> R {
    let log = Arc::clone(log);
    move |keys: Vec<String>, env| {
        log.lock().unwrap().push(keys.clone());
        function(keys, env)
    }
}

fn load_a_b_c_d<B>(loader: &Loader<String, String, (), String, String, B>) -> Vec<String>
where
    B: batchcache::BatchFn<String, String, (), String> + Send + 'static,
    B::Fut: Send + 'static,
{
    let _ = loader.load("A".to_string());
    let _ = loader.load("B".to_string());
    let _ = loader.load_many(vec!["C".to_string(), "D".to_string()]);

    executor::block_on(loader.dispatch_and_join())
        .into_iter()
        .map(|outcome| outcome.unwrap())
        .collect()
}

#[test]
fn context_is_passed_to_batch_function() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let options = LoaderOptions {
        environment: Box::new(|| Environment::builder().context("ctx".to_string()).build()),
        ..LoaderOptions::default()
    };
    let loader = Loader::with_options(key_logger(&log, list_loader), options);

    let results = load_a_b_c_d(&loader);

    assert_eq!(results, &["A-ctx", "B-ctx", "C-ctx", "D-ctx"]);

    // One invocation, with every key, in request order.
    assert_eq!(
        *log.lock().unwrap(),
        vec![vec![
            "A".to_string(),
            "B".to_string(),
            "C".to_string(),
            "D".to_string()
        ]]
    );
}

#[test]
fn context_is_passed_to_map_batch_function() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let options = LoaderOptions {
        environment: Box::new(|| Environment::builder().context("ctx".to_string()).build()),
        ..LoaderOptions::default()
    };
    let loader = Loader::with_options(key_logger(&log, map_loader), options);

    let results = load_a_b_c_d(&loader);

    // The map the batch function built is unordered; the outcomes still
    // come back in request order.
    assert_eq!(results, &["A-ctx", "B-ctx", "C-ctx", "D-ctx"]);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn unset_context_is_observed_if_you_do_nothing() {
    let loader = Loader::new(list_loader);

    let results = load_a_b_c_d(&loader);

    assert_eq!(results, &["A-null", "B-null", "C-null", "D-null"]);
}

#[test]
fn unset_context_is_observed_by_map_batch_function() {
    let loader = Loader::new(map_loader);

    let results = load_a_b_c_d(&loader);

    assert_eq!(results, &["A-null", "B-null", "C-null", "D-null"]);
}

#[test]
fn environment_is_produced_at_dispatch_time() {
    let stamp = Arc::new(AtomicUsize::new(0));

    let options = LoaderOptions {
        environment: Box::new({
            let stamp = Arc::clone(&stamp);
            move || {
                Environment::builder()
                    .context(stamp.load(Ordering::SeqCst).to_string())
                    .build()
            }
        }),
        ..LoaderOptions::default()
    };
    let loader = Loader::with_options(list_loader, options);

    // The stamp changes between the load and the dispatch; the batch
    // function must observe the dispatch-time value.
    let fut1 = loader.load("A".to_string());
    stamp.store(7, Ordering::SeqCst);
    executor::block_on(loader.dispatch());
    assert_eq!(executor::block_on(fut1).unwrap(), "A-7");

    // Each cycle gets a fresh environment.
    let fut2 = loader.load("B".to_string());
    stamp.store(9, Ordering::SeqCst);
    executor::block_on(loader.dispatch());
    assert_eq!(executor::block_on(fut2).unwrap(), "B-9");
}

#[test]
fn key_contexts_reach_the_batch_function() {
    async fn keyed_loader(
        keys: Vec<String>,
        env: Environment<String, String>,
    ) -> Result<Vec<String>, ()> {
        Ok(keys
            .iter()
            .map(|key| {
                format!(
                    "{}-{}",
                    key,
                    env.key_context(key).map(String::as_str).unwrap_or("none")
                )
            })
            .collect())
    }

    let options = LoaderOptions {
        environment: Box::new(|| {
            Environment::builder()
                .key_context("A".to_string(), "meta".to_string())
                .build()
        }),
        ..LoaderOptions::default()
    };
    let loader = Loader::with_options(keyed_loader, options);

    let fut_a = loader.load("A".to_string());
    let fut_b = loader.load("B".to_string());
    executor::block_on(loader.dispatch());

    assert_eq!(executor::block_on(fut_a).unwrap(), "A-meta");
    assert_eq!(executor::block_on(fut_b).unwrap(), "B-none");
}
