use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use axum_server::{tls_rustls::RustlsConfig, Handle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;

use crate::{
    discovery::http::{handle_info, handle_register},
    error::{LocalSendError, Result},
    transfer::{
        download::{handle_download, handle_prepare_download},
        handle_cancel,
        upload::{handle_prepare_upload, handle_upload},
    },
    LocalService, API_V1, API_V2,
};

const MAX_BODY_BYTES: usize = 1024 * 1024 * 1024;

impl LocalService {
    /// Binds the configured port on all interfaces and serves until the
    /// service is stopped, over HTTPS unless the config says otherwise.
    pub async fn start_http_server(&self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        if self.config.https {
            self.serve_tls(listener).await
        } else {
            self.serve(TcpListener::from_std(listener)?).await
        }
    }

    /// Plain HTTP on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        log::info!("HTTP server listening on {}", listener.local_addr()?);
        let cancel = self.cancellation().clone();
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
        Ok(())
    }

    /// HTTPS with this device's certificate on an already bound listener.
    pub async fn serve_tls(&self, listener: std::net::TcpListener) -> Result<()> {
        // only one provider is compiled in, so a second install is harmless
        let _ = rustls::crypto::ring::default_provider().install_default();

        let security = self.security();
        let tls = RustlsConfig::from_pem(
            security.certificate_pem.clone().into_bytes(),
            security.private_key_pem.clone().into_bytes(),
        )
        .await
        .map_err(|e| LocalSendError::CertificateError(e.to_string()))?;

        log::info!("HTTPS server listening on {}", listener.local_addr()?);
        let handle = Handle::new();
        tokio::spawn(shutdown(handle.clone(), self.cancellation().clone()));

        axum_server::from_tcp_rustls(listener, tls)
            .handle(handle)
            .serve(
                self.router()
                    .into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await?;
        Ok(())
    }

    /// Every endpoint, under both API prefixes where older peers expect it.
    ///
    /// The body limit guards the JSON endpoints only. File bodies on
    /// `/upload` are streamed to the sink and may be any size.
    pub fn router(&self) -> Router {
        let common = Router::new()
            .route("/info", get(handle_info))
            .route("/register", post(handle_register))
            .route("/prepare-upload", post(handle_prepare_upload));

        let v2 = common
            .clone()
            .route("/cancel", post(handle_cancel))
            .route("/prepare-download", post(handle_prepare_download))
            .route("/download", get(handle_download));

        Router::new()
            .nest(API_V1, common)
            .nest(API_V2, v2)
            .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
            .route(&format!("{API_V2}/upload"), post(handle_upload))
            .layer(DefaultBodyLimit::disable())
            .with_state(self.clone())
    }
}

async fn shutdown(handle: Handle, cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("shutting down https server");
    handle.graceful_shutdown(Some(Duration::from_secs(5)));
}
