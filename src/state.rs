//! Shared application state, passed explicitly to the endpoint handlers,
//! processor and workers.
use crate::{
    activity::Message,
    cache::{self, Cache},
    client::HttpClient,
    config::RelayConfig,
    logger::LogHandle,
    pusher::Pusher,
    signer::Signer,
    store::{Instance, Store, StoreRuntime},
    Result,
};
use std::{env, sync::Arc};

pub struct Context {
    pub config: RelayConfig,
    pub store: Store,
    pub cache: Arc<dyn Cache>,
    pub client: Arc<HttpClient>,
    pub pusher: Pusher,
    pub signer: Arc<Signer>,
}

impl Context {
    /// Connect the store, run migrations, load (or create, exactly once)
    /// the relay keypair and start the push workers.
    pub fn boot(config: RelayConfig, log: LogHandle) -> Result<Arc<Self>> {
        let store = Store::connect(&config.database)?;

        let mut session = store.session();

        let pem = session.get_config("private-key")?;
        let signer = if pem.is_empty() {
            tracing::info!("generating a new keypair for the relay actor");
            let signer = Signer::generate(config.keyid())?;
            session.put_config("private-key", &signer.private_pem())?;
            signer
        } else {
            Signer::from_pem(config.keyid(), &pem)?
        };
        let signer = Arc::new(signer);

        // the stored log level applies unless LOG_LEVEL overrides it
        let settings = session.get_config_all()?;
        if env::var("LOG_LEVEL").is_err() {
            log.set_level(settings.log_level)?;
        }

        drop(session);

        store.set_runtime(StoreRuntime {
            signer: Arc::clone(&signer),
            log,
        });

        let cache = cache::build(&config.cache, &store)?;
        let client = Arc::new(HttpClient::new(
            Arc::clone(&signer),
            Arc::clone(&cache),
            config.push_limit,
            config.timeout,
        )?);
        let pusher = Pusher::start(Arc::clone(&client), config.worker_count());

        Ok(Arc::new(Self {
            config,
            store,
            cache,
            client,
            pusher,
            signer,
        }))
    }

    pub fn push_message(&self, inbox: String, message: Message, instance: Option<Instance>) {
        self.pusher.push_message(inbox, message, instance);
    }

    pub async fn shutdown(&self) {
        self.pusher.shutdown().await;
    }

    /// A context over an in-memory store whose pusher queue is captured
    /// rather than delivered.
    #[cfg(test)]
    pub(crate) fn test() -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<crate::pusher::PostItem>) {
        use crate::cache::SqlCache;

        let mut config = RelayConfig::default();
        config.domain = "relay.example.net".to_owned();
        config.timeout = 2;

        let store = Store::memory().expect("to create an in-memory store");
        let signer = Arc::new(crate::signer::tests::test_signer());
        let cache: Arc<dyn Cache> = Arc::new(SqlCache::new(store.clone()));
        let client = Arc::new(
            HttpClient::new(
                Arc::clone(&signer),
                Arc::clone(&cache),
                config.push_limit,
                config.timeout,
            )
            .expect("to build a test client"),
        );
        let (pusher, rx) = Pusher::collector();

        (
            Arc::new(Self {
                config,
                store,
                cache,
                client,
                pusher,
                signer,
            }),
            rx,
        )
    }
}
