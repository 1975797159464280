//! Street-level imagery client with key failover

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::config::FetcherConfig;
use crate::core::errors::{FetchError, Result};
use crate::core::key_pool::KeyPool;
use crate::core::models::{
    Heading, HeadingFailure, HeadingImage, ImageMetadata, LocationImages,
};
use crate::core::throttle::Throttle;
use crate::core::transport::{ImageryTransport, ReqwestTransport, TransportResponse};

/// Payload status signalling that imagery exists
const METADATA_OK: &str = "OK";

/// Attempts per logical request: the first try plus one failover
const MAX_ATTEMPTS: usize = 2;

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    status: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    pano_id: Option<String>,
    #[serde(default)]
    location: Option<LatLng>,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

/// Imagery client sharing one key pool with every other client in the process
#[derive(Clone)]
pub struct StreetViewClient<T = ReqwestTransport> {
    transport: Arc<T>,
    config: Arc<FetcherConfig>,
    key_pool: KeyPool,
    throttle: Throttle,
}

impl StreetViewClient<ReqwestTransport> {
    /// Create a client over HTTP
    pub fn new(config: FetcherConfig, key_pool: KeyPool) -> Result<Self> {
        let transport = ReqwestTransport::new(Duration::from_millis(config.timeout_ms))?;
        Ok(Self::with_transport(config, key_pool, transport))
    }
}

impl<T: ImageryTransport> StreetViewClient<T> {
    /// Create a client over an arbitrary transport
    pub fn with_transport(config: FetcherConfig, key_pool: KeyPool, transport: T) -> Self {
        let throttle = Throttle::from_millis(config.request_delay_ms);
        Self {
            transport: Arc::new(transport),
            config: Arc::new(config),
            key_pool,
            throttle,
        }
    }

    pub fn key_pool(&self) -> &KeyPool {
        &self.key_pool
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Issue one logical GET, swapping keys once on denial
    async fn send_with_failover<F>(&self, url: &str, build_query: F) -> Result<TransportResponse>
    where
        F: Fn(&str) -> Vec<(&'static str, String)>,
    {
        let denial = self.config.denial_status;

        for attempt in 0..MAX_ATTEMPTS {
            let key = self
                .key_pool
                .get_key()
                .await
                .ok_or(FetchError::AllKeysExhausted)?;

            self.throttle.throttle().await;

            let response = match self.transport.get(url, &build_query(&key)).await {
                Ok(response) => response,
                Err(e) => {
                    self.key_pool.record_request(&key, false, 0).await;
                    return Err(e);
                }
            };

            self.key_pool
                .record_request(&key, response.is_ok(), response.status)
                .await;

            if response.status != denial {
                return Ok(response);
            }

            if attempt + 1 < MAX_ATTEMPTS {
                warn!("Request denied (HTTP {}), retrying with another key", denial);
            }
        }

        Err(FetchError::AccessDenied { status: denial })
    }

    /// Look up whether imagery exists at a coordinate
    pub async fn fetch_metadata(&self, lat: f64, lng: f64) -> Result<ImageMetadata> {
        let location = format!("{},{}", lat, lng);
        let response = self
            .send_with_failover(&self.config.metadata_endpoint, |key| {
                vec![("location", location.clone()), ("key", key.to_string())]
            })
            .await?;

        if !response.is_ok() {
            debug!("Metadata lookup for {} returned HTTP {}", location, response.status);
            return Err(FetchError::NoImageryAvailable);
        }

        let metadata: MetadataResponse = serde_json::from_slice(&response.body).map_err(|e| {
            FetchError::InvalidResponse {
                message: e.to_string(),
            }
        })?;

        if metadata.status != METADATA_OK {
            debug!("No imagery at {} ({})", location, metadata.status);
            return Err(FetchError::NoImageryAvailable);
        }

        Ok(ImageMetadata {
            pano_id: metadata.pano_id,
            capture_date: metadata.date,
            lat: metadata.location.as_ref().map(|l| l.lat),
            lng: metadata.location.as_ref().map(|l| l.lng),
        })
    }

    /// Download one directional image
    pub async fn fetch_image(
        &self,
        lat: f64,
        lng: f64,
        heading: Heading,
        metadata: &ImageMetadata,
    ) -> Result<HeadingImage> {
        let target = match &metadata.pano_id {
            Some(pano) => ("pano", pano.clone()),
            None => ("location", format!("{},{}", lat, lng)),
        };

        let response = self
            .send_with_failover(&self.config.image_endpoint, |key| {
                vec![
                    ("size", self.config.image_size.clone()),
                    target.clone(),
                    ("heading", heading.to_string()),
                    ("pitch", self.config.pitch.to_string()),
                    ("fov", self.config.fov.to_string()),
                    ("key", key.to_string()),
                ]
            })
            .await?;

        if !response.is_ok() {
            return Err(FetchError::TransientFetchFailure {
                message: format!("image request returned HTTP {}", response.status),
            });
        }

        if response.body.is_empty() {
            return Err(FetchError::InvalidResponse {
                message: "empty image body".to_string(),
            });
        }

        Ok(HeadingImage {
            heading,
            bytes: response.body,
            capture_date: metadata.capture_date.clone(),
            pano_id: metadata.pano_id.clone(),
        })
    }

    /// Fetch the four standard headings at a coordinate
    pub async fn fetch_location(&self, lat: f64, lng: f64) -> Result<LocationImages> {
        self.fetch_headings(lat, lng, &Heading::STANDARD).await
    }

    /// Fetch the given headings; a failed heading does not abort the others.
    ///
    /// Errors only when the metadata step fails. Once the pool runs dry the
    /// remaining headings are recorded as exhausted without being attempted.
    pub async fn fetch_headings(
        &self,
        lat: f64,
        lng: f64,
        headings: &[Heading],
    ) -> Result<LocationImages> {
        let metadata = self.fetch_metadata(lat, lng).await?;

        let mut result = LocationImages {
            metadata,
            ..Default::default()
        };

        for &heading in headings {
            if result.exhausted() {
                result.failures.push(HeadingFailure {
                    heading,
                    error: FetchError::AllKeysExhausted,
                });
                continue;
            }

            match self.fetch_image(lat, lng, heading, &result.metadata).await {
                Ok(image) => result.images.push(image),
                Err(error) => {
                    if error.is_exhaustion() {
                        warn!("Keys exhausted while downloading heading {}", heading);
                    } else {
                        warn!("Heading {} at {},{} failed: {}", heading, lat, lng, error);
                    }
                    result.failures.push(HeadingFailure { heading, error });
                }
            }
        }

        info!(
            "Fetched {}/{} headings at {},{}",
            result.images.len(),
            headings.len(),
            lat,
            lng
        );

        Ok(result)
    }

    /// Ad hoc fetch of a single heading
    pub async fn fetch_heading(&self, lat: f64, lng: f64, heading: Heading) -> Result<HeadingImage> {
        let metadata = self.fetch_metadata(lat, lng).await?;
        self.fetch_image(lat, lng, heading, &metadata).await
    }
}
