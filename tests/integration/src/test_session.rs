#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use stowage_access::{AuthServiceClient, CapabilityWorker, ConsoleClient};
    use stowage_browser::{
        BrowserConfig, Cursor, ListingEngine, S3ClientFactory, SessionManager, SessionState,
    };
    use stowage_core::{Passphrase, ProjectId, StowageConfig};

    /// Session manager wired to the console and credential service from env.
    async fn manager() -> SessionManager {
        let config = StowageConfig::from_env();
        let token = std::env::var("CONSOLE_SESSION_TOKEN").unwrap_or_default();
        let console = ConsoleClient::new(&config.console_api_url, &config.satellite_node_url)
            .with_session_token(token);
        let worker = CapabilityWorker::spawn().await.unwrap();
        SessionManager::new(
            Arc::new(console),
            Arc::new(worker),
            Arc::new(AuthServiceClient::new(&config.gateway_auth_url)),
            Arc::new(S3ClientFactory),
            config,
            BrowserConfig::default(),
        )
    }

    fn project() -> ProjectId {
        let id = std::env::var("STOWAGE_PROJECT_ID").unwrap_or_default();
        ProjectId::parse(&id).unwrap()
    }

    #[tokio::test]
    #[ignore = "requires running console and gateway"]
    async fn test_should_open_session_against_live_services() {
        let sessions = manager().await;
        let passphrase = Passphrase::new("integration passphrase");

        sessions.open_session(project(), &passphrase).await.unwrap();
        assert_eq!(sessions.state(), SessionState::ClientReady);

        let bucket = std::env::var("STOWAGE_BUCKET").unwrap_or_else(|_| "demo".to_owned());
        let mut listing =
            ListingEngine::new(sessions.browse_session().slot(), BrowserConfig::default());
        listing.set_bucket(&bucket);
        listing.list(Cursor::default()).await.unwrap();

        sessions.clear().await;
        assert_eq!(sessions.state(), SessionState::Empty);
    }
}
