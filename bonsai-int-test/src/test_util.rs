use bonsai::cache::TreeHandleCache;
use bonsai::common::{RecordId, RecordRef, RecordResolver};
use bonsai::config::{BonsaiConfig, BonsaiConfigBuilder};
use bonsai::errors::{BonsaiError, BonsaiResult, ErrorKind};
use bonsai::ridbag::RidBag;
use bonsai::store::{PageStore, WriteCache};
use bonsai::tree::PostingMarker;
use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{env, fs, thread};

/// Cluster the test resolver saves records into.
pub const TEST_CLUSTER: i32 = 11;

/// Runs a test with retry logic and error handling.
/// Tests run on the current thread to avoid thread exhaustion when running many tests in parallel.
pub fn run_test<T, B, A>(before: B, test: T, after: A)
where
    T: Fn(TestContext) -> BonsaiResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    B: Fn() -> BonsaiResult<TestContext> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
    A: Fn(TestContext) -> BonsaiResult<()> + std::panic::UnwindSafe + std::panic::RefUnwindSafe,
{
    const MAX_RETRIES: u32 = 3;
    let mut last_error: Option<String> = None;
    let mut last_backtrace: Option<String> = None;

    for attempt in 1..=MAX_RETRIES {
        let start_time = Instant::now();

        let result = std::panic::catch_unwind(|| {
            let backtrace = Backtrace::capture();
            match before() {
                Ok(ctx) => match test(ctx.clone()) {
                    Ok(_) => match after(ctx.clone()) {
                        Ok(_) => Ok(()),
                        Err(e) => Err((format!("After run failed: {:?}", e), backtrace.to_string())),
                    },
                    Err(e) => {
                        let _ = after(ctx.clone());
                        Err((format!("Test failed: {:?}", e), backtrace.to_string()))
                    }
                },
                Err(e) => Err((format!("Before run failed: {:?}", e), backtrace.to_string())),
            }
        });

        let elapsed = start_time.elapsed();

        match result {
            Ok(Ok(_)) => return,
            Ok(Err((e, bt))) => {
                last_error = Some(e.clone());
                last_backtrace = Some(bt);
                if attempt < MAX_RETRIES {
                    eprintln!(
                        "\n========== Test Attempt {}/{} Failed (took {:?}) ==========",
                        attempt, MAX_RETRIES, elapsed
                    );
                    eprintln!("Error: {}", e);
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
            }
            Err(panic_err) => {
                let err_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    format!("Unknown panic: {:?}", panic_err.type_id())
                };

                last_error = Some(format!("Panic: {}", err_msg));
                last_backtrace = Some(Backtrace::capture().to_string());

                if attempt < MAX_RETRIES {
                    eprintln!(
                        "\n========== Test Attempt {}/{} Panicked (took {:?}) ==========",
                        attempt, MAX_RETRIES, elapsed
                    );
                    eprintln!("{}", err_msg);
                    thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
            }
        }
    }

    eprintln!("\n==================== TEST FAILED ====================");
    eprintln!("Failed after {} attempts", MAX_RETRIES);
    eprintln!("Last error: {}", last_error.as_deref().unwrap_or("Unknown"));
    if let Some(bt) = &last_backtrace {
        if !bt.is_empty() && !bt.contains("disabled") {
            eprintln!("\nBacktrace:\n{}", bt);
        }
    }
    eprintln!("=====================================================\n");

    panic!(
        "Test failed after {} attempts. Last error: {}",
        MAX_RETRIES,
        last_error.unwrap_or_default()
    );
}

/// Hands out persistent identities in [`TEST_CLUSTER`] and can be told to
/// refuse saving.
#[derive(Default)]
pub struct TestResolver {
    next: AtomicI64,
    refuse: AtomicBool,
}

impl TestResolver {
    pub fn new() -> Self {
        TestResolver::default()
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl RecordResolver for TestResolver {
    fn save(&self, record: &RecordRef) -> BonsaiResult<RecordId> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(BonsaiError::new(
                &format!("Refusing to save {:?}", record),
                ErrorKind::IOError,
            ));
        }
        let position = self.next.fetch_add(1, Ordering::SeqCst);
        Ok(RecordId::new(TEST_CLUSTER, position))
    }

    fn load(&self, id: &RecordId) -> BonsaiResult<Option<RecordRef>> {
        Ok(Some(RecordRef::new(*id)))
    }
}

#[derive(Clone)]
pub struct TestContext {
    path: Option<String>,
    config: BonsaiConfig,
    store: Arc<dyn PageStore>,
    bags: TreeHandleCache<i32>,
    postings: TreeHandleCache<PostingMarker>,
    resolver: Arc<TestResolver>,
}

impl TestContext {
    /// Opens caches over `store`. Bags and posting sets get a write cache
    /// each, they never share a file.
    pub fn new(path: Option<String>, config: BonsaiConfig, store: Arc<dyn PageStore>) -> Self {
        let bags = TreeHandleCache::new(WriteCache::with_store(&config, store.clone()));
        let postings = TreeHandleCache::new(WriteCache::with_store(&config, store.clone()));
        TestContext {
            path,
            config,
            store,
            bags,
            postings,
            resolver: Arc::new(TestResolver::new()),
        }
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn config(&self) -> BonsaiConfig {
        self.config.clone()
    }

    pub fn bags(&self) -> TreeHandleCache<i32> {
        self.bags.clone()
    }

    pub fn postings(&self) -> TreeHandleCache<PostingMarker> {
        self.postings.clone()
    }

    pub fn resolver(&self) -> Arc<TestResolver> {
        self.resolver.clone()
    }

    /// A fresh bag that allocates its tree in [`TEST_CLUSTER`].
    pub fn new_bag(&self) -> RidBag {
        let mut bag = RidBag::new(self.bags(), self.resolver.clone());
        bag.set_owner_cluster(TEST_CLUSTER);
        bag
    }

    /// Closes the caches and opens new ones over the same store, as after a
    /// restart. Only flushed pages survive.
    pub fn reopen(&self) -> BonsaiResult<TestContext> {
        self.bags.close()?;
        self.postings.close()?;
        let mut reopened = TestContext::new(self.path.clone(), self.config.clone(), self.store.clone());
        reopened.resolver = self.resolver.clone();
        Ok(reopened)
    }
}

pub fn random_path() -> String {
    let id = uuid::Uuid::new_v4();
    let temp_dir = env::temp_dir();
    temp_dir.join(id.to_string()).to_string_lossy().to_string()
}

/// Small pages and buckets so that a few hundred keys already build a deep tree.
pub fn test_config_builder() -> BonsaiConfigBuilder {
    BonsaiConfig::builder()
        .geometry(4096, 512)
        .thresholds(8, 4)
        .ridbag_prefetch_size(16)
}

#[cfg(feature = "file")]
use bonsai::store::FilePageStore;
#[cfg(feature = "file")]
use std::path::Path;

#[cfg(all(feature = "memory", not(feature = "file")))]
use bonsai::store::MemoryPageStore;

pub fn create_test_context() -> BonsaiResult<TestContext> {
    create_test_context_with(test_config_builder())
}

#[cfg(feature = "file")]
pub fn create_test_context_with(builder: BonsaiConfigBuilder) -> BonsaiResult<TestContext> {
    let path = random_path();
    let config = builder.storage_path(&path).build()?;
    let store = FilePageStore::open(Path::new(&path))?;
    Ok(TestContext::new(Some(path), config, Arc::new(store)))
}

#[cfg(all(feature = "memory", not(feature = "file")))]
pub fn create_test_context_with(builder: BonsaiConfigBuilder) -> BonsaiResult<TestContext> {
    let config = builder.build()?;
    Ok(TestContext::new(None, config, Arc::new(MemoryPageStore::new())))
}

pub fn cleanup(ctx: TestContext) -> BonsaiResult<()> {
    if let Err(e) = ctx.bags().close() {
        eprintln!("Warning: Failed to close bag cache: {:?}", e);
    }
    if let Err(e) = ctx.postings().close() {
        eprintln!("Warning: Failed to close posting cache: {:?}", e);
    }

    if let Some(path) = ctx.path() {
        match fs::remove_dir_all(path) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => eprintln!("Warning: Failed to remove test directory {}: {:?}", path, e),
        }
    }
    Ok(())
}
