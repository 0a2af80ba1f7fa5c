#[cfg(test)]
mod tests {
    use stowage_browser::{BrowserConfig, Cursor, ListingEngine, SortDirection, SortKey};

    use crate::{cleanup_bucket, create_test_bucket, s3_client, seed_objects, store_slot};

    #[tokio::test]
    #[ignore = "requires running gateway"]
    async fn test_should_list_folders_before_files() {
        let client = s3_client();
        let bucket = create_test_bucket(&client, "listing").await;
        seed_objects(&client, &bucket, "docs/", 2).await;
        seed_objects(&client, &bucket, "a-", 3).await;

        let mut listing = ListingEngine::new(store_slot(), BrowserConfig::default());
        listing.set_bucket(&bucket);
        let keys: Vec<String> = listing
            .list(Cursor::default())
            .await
            .unwrap()
            .iter()
            .map(|e| e.key.clone())
            .collect();
        assert_eq!(keys, vec!["docs/", "a-00000", "a-00001", "a-00002"]);

        listing.sort(SortKey::Name, SortDirection::Descending);
        assert_eq!(listing.entries()[0].key, "docs/");
        assert_eq!(listing.entries()[1].key, "a-00002");

        cleanup_bucket(&client, &bucket).await;
    }

    #[tokio::test]
    #[ignore = "requires running gateway"]
    async fn test_should_return_identical_page_on_revisit() {
        let client = s3_client();
        let bucket = create_test_bucket(&client, "pages").await;
        seed_objects(&client, &bucket, "k", 1200).await;

        let mut listing = ListingEngine::new(store_slot(), BrowserConfig::default());
        listing.set_bucket(&bucket);
        let sixth: Vec<String> = listing
            .list(Cursor::new(6, 100))
            .await
            .unwrap()
            .iter()
            .map(|e| e.key.clone())
            .collect();
        listing.list(Cursor::new(7, 100)).await.unwrap();
        let again: Vec<String> = listing
            .list(Cursor::new(6, 100))
            .await
            .unwrap()
            .iter()
            .map(|e| e.key.clone())
            .collect();

        assert_eq!(sixth.len(), 100);
        assert_eq!(sixth.first().map(String::as_str), Some("k00500"));
        assert_eq!(sixth, again);

        cleanup_bucket(&client, &bucket).await;
    }

    #[tokio::test]
    #[ignore = "requires running gateway"]
    async fn test_should_count_objects_recursively() {
        let client = s3_client();
        let bucket = create_test_bucket(&client, "count").await;
        seed_objects(&client, &bucket, "deep/nested/", 7).await;
        seed_objects(&client, &bucket, "top", 3).await;

        let mut listing = ListingEngine::new(store_slot(), BrowserConfig::default());
        listing.set_bucket(&bucket);
        assert_eq!(listing.count_objects().await.unwrap(), 10);

        cleanup_bucket(&client, &bucket).await;
    }
}
