#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use stowage_browser::{
        BrowserConfig, BytesSource, ListingEngine, UploadEvent, UploadPipeline, UploadStatus,
    };

    use crate::{cleanup_bucket, create_test_bucket, s3_client, store_slot};

    fn pipeline(bucket: &str, config: BrowserConfig) -> UploadPipeline {
        let slot = store_slot();
        let mut listing = ListingEngine::new(slot.clone(), config.clone());
        listing.set_bucket(bucket);
        UploadPipeline::new(slot, config, listing.shared())
    }

    #[tokio::test]
    #[ignore = "requires running gateway"]
    async fn test_should_upload_multipart_object() {
        let client = s3_client();
        let bucket = create_test_bucket(&client, "multipart").await;
        let config = BrowserConfig::builder()
            .upload_part_size(5 * 1024 * 1024)
            .build();
        let uploads = pipeline(&bucket, config);
        let mut events = uploads.subscribe();

        let data: Vec<u8> = (0..12 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let id = uploads
            .enqueue(&bucket, "big.bin", Arc::new(BytesSource::new(data.clone())))
            .unwrap();

        let completed = tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if let Ok(UploadEvent::Completed { id: done, .. }) = events.recv().await {
                    break done;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(completed, id);
        assert_eq!(uploads.task(id).unwrap().status, UploadStatus::Finished);

        let body = client
            .get_object()
            .bucket(&bucket)
            .key("big.bin")
            .send()
            .await
            .unwrap()
            .body
            .collect()
            .await
            .unwrap()
            .into_bytes();
        assert_eq!(body.as_ref(), data.as_slice());

        cleanup_bucket(&client, &bucket).await;
    }

    #[tokio::test]
    #[ignore = "requires running gateway"]
    async fn test_should_leave_no_pending_upload_after_cancel() {
        let client = s3_client();
        let bucket = create_test_bucket(&client, "cancel").await;
        let config = BrowserConfig::builder()
            .upload_part_size(5 * 1024 * 1024)
            .upload_queue_size(1)
            .build();
        let uploads = pipeline(&bucket, config);

        let data = vec![7u8; 40 * 1024 * 1024];
        let id = uploads
            .enqueue(&bucket, "cancelled.bin", Arc::new(BytesSource::new(data)))
            .unwrap();
        assert!(uploads.cancel(id));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let pending = client
            .list_multipart_uploads()
            .bucket(&bucket)
            .send()
            .await
            .unwrap();
        assert!(pending.uploads().is_empty());
        assert_eq!(uploads.task(id).unwrap().status, UploadStatus::Cancelled);

        cleanup_bucket(&client, &bucket).await;
    }
}
