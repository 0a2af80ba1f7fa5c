#[cfg(test)]
mod tests {
    use stowage_browser::DeletionEngine;
    use stowage_browser::store::ObjectIdentifier;

    use crate::{cleanup_bucket, create_test_bucket, s3_client, seed_objects, store_slot};

    async fn remaining(client: &aws_sdk_s3::Client, bucket: &str) -> usize {
        let resp = client.list_objects_v2().bucket(bucket).send().await.unwrap();
        resp.contents().len()
    }

    #[tokio::test]
    #[ignore = "requires running gateway"]
    async fn test_should_delete_folder_recursively_across_batches() {
        let client = s3_client();
        let bucket = create_test_bucket(&client, "folder").await;
        seed_objects(&client, &bucket, "a/", 1000).await;
        seed_objects(&client, &bucket, "a/inner/", 5).await;
        seed_objects(&client, &bucket, "keep", 1).await;

        let engine = DeletionEngine::new(store_slot());
        let deleted = engine.delete_folder(&bucket, "a/", false).await.unwrap();

        assert_eq!(deleted, 1005);
        assert_eq!(remaining(&client, &bucket).await, 1);

        cleanup_bucket(&client, &bucket).await;
    }

    #[tokio::test]
    #[ignore = "requires running gateway"]
    async fn test_should_delete_mixed_selection() {
        let client = s3_client();
        let bucket = create_test_bucket(&client, "selection").await;
        seed_objects(&client, &bucket, "f", 3).await;
        seed_objects(&client, &bucket, "dir/", 4).await;

        let engine = DeletionEngine::new(store_slot());
        let deleted = engine
            .delete_selection(
                &bucket,
                vec![ObjectIdentifier::key("f00000"), ObjectIdentifier::key("f00001")],
                vec!["dir/".to_owned()],
                false,
            )
            .await
            .unwrap();

        assert_eq!(deleted, 6);
        assert_eq!(remaining(&client, &bucket).await, 1);

        cleanup_bucket(&client, &bucket).await;
    }
}
