use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rusty_music::music::audio_sources::query::parse;
use rusty_music::music::audio_sources::resolver::ProviderResolver;
use rusty_music::music::utils::node_client::{LoadResult, NodePlaylist, PlaylistInfo};
use rusty_music::music::utils::track_cache::TrackCache;
use rusty_music::{Feature, NodeConfig, NodePool, Provider};

use crate::common::fixtures::node_track;
use crate::common::mocks::FakeNode;
use crate::common::register;

fn resolver_over(node: Arc<FakeNode>, provider: Provider) -> ProviderResolver {
    let pool = Arc::new(NodePool::new());
    register(&pool, "main", node, vec![Feature::Provider(provider)], 0);
    ProviderResolver::new(pool, Arc::new(TrackCache::default()))
}

#[tokio::test]
async fn empty_search_reports_the_query_as_failed() {
    let resolver = resolver_over(Arc::new(FakeNode::new()), Provider::Deezer);
    let query = parse("dzsearch:test").unwrap();

    let outcome = resolver.resolve(&[query.clone()], None).await;

    assert!(outcome.successful.is_empty());
    assert_eq!(outcome.total_count, 0);
    assert_eq!(outcome.failed, vec![query.clone()]);
    assert_eq!(
        query.not_found_message(),
        "No tracks were found for your query on Deezer."
    );
}

#[tokio::test]
async fn batch_keeps_input_order_and_search_takes_the_best_match() {
    let node = FakeNode::new()
        .with_load(
            "dzsearch:daft punk",
            LoadResult::Search(vec![
                node_track("second-best", "deezer", Some(2)),
                node_track("best", "deezer", Some(1)),
            ]),
        )
        .with_load(
            "https://www.deezer.com/en/playlist/123",
            LoadResult::Playlist(NodePlaylist {
                info: PlaylistInfo {
                    name: "Discovery".to_string(),
                    selected_track: -1,
                },
                tracks: vec![
                    node_track("p1", "deezer", None),
                    node_track("p2", "deezer", None),
                    node_track("p3", "deezer", None),
                ],
            }),
        );
    let resolver = resolver_over(Arc::new(node), Provider::Deezer);
    let queries = vec![
        parse("dzsearch:daft punk").unwrap(),
        parse("dzsearch:nothing here").unwrap(),
        parse("https://www.deezer.com/en/playlist/123").unwrap(),
    ];

    let outcome = resolver.resolve(&queries, Some("bob")).await;

    let identifiers: Vec<&str> = outcome
        .successful
        .iter()
        .map(|track| track.identifier.as_str())
        .collect();
    assert_eq!(identifiers, vec!["best", "p1", "p2", "p3"]);
    assert_eq!(outcome.total_count, 5);
    assert_eq!(outcome.failed, vec![queries[1].clone()]);
    assert!(
        outcome
            .successful
            .iter()
            .all(|track| track.requester.as_deref() == Some("bob"))
    );
}

#[tokio::test]
async fn repeated_queries_are_served_from_the_cache() {
    let node = Arc::new(FakeNode::new().with_load(
        "ytmsearch:lofi",
        LoadResult::Search(vec![node_track("lofi-1", "youtube", None)]),
    ));
    let resolver = resolver_over(node.clone(), Provider::YoutubeMusic);
    let query = parse("lofi").unwrap();

    let first = resolver.resolve_one(&query).await.unwrap();
    let second = resolver.resolve_one(&query).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(node.load_calls(), 1);
    assert_eq!(resolver.cache().get(&first[0].encoded_id), Some(first[0].clone()));
}

#[tokio::test]
async fn search_choices_are_remembered_per_requester() {
    let node = FakeNode::new().with_load(
        "scsearch:ambient",
        LoadResult::Search(vec![
            node_track("a", "soundcloud", Some(1)),
            node_track("b", "soundcloud", Some(2)),
        ]),
    );
    let resolver = resolver_over(Arc::new(node), Provider::SoundCloud);

    let offered = resolver
        .search(&parse("scsearch:ambient").unwrap(), "alice")
        .await
        .unwrap();

    assert_eq!(offered.len(), 2);
    assert_eq!(resolver.choose("alice", 1).map(|t| t.identifier), Some("b".to_string()));
    assert_eq!(resolver.choose("carol", 0), None);
}

#[tokio::test]
async fn resolves_through_a_rest_node() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v4/stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "players": 1,
            "playingPlayers": 0,
            "uptime": 1000,
            "cpu": {"cores": 4, "systemLoad": 0.0, "lavalinkLoad": 0.0}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v4/loadtracks"))
        .and(query_param("identifier", "ytsearch:never gonna"))
        .and(header("Authorization", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "loadType": "search",
            "data": [{
                "encoded": "QAAAjQIAJVJpY2sgQXN0bGV5",
                "info": {
                    "identifier": "dQw4w9WgXcQ",
                    "author": "Rick Astley",
                    "length": 212000,
                    "isStream": false,
                    "title": "Never Gonna Give You Up",
                    "uri": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                    "sourceName": "youtube"
                }
            }]
        })))
        .mount(&server)
        .await;

    let pool = Arc::new(NodePool::new());
    pool.add_node(NodeConfig {
        identifier: "rest".to_string(),
        base_url: server.uri(),
        password: "secret".to_string(),
        capabilities: vec![Feature::Provider(Provider::Youtube)],
        managed: false,
    })
    .unwrap();
    assert!(pool.find_best_node(Feature::Provider(Provider::Youtube)).is_none());
    pool.refresh_health().await;

    let resolver = ProviderResolver::new(pool, Arc::new(TrackCache::default()));
    let outcome = resolver
        .resolve(&[parse("ytsearch:never gonna").unwrap()], None)
        .await;

    assert_eq!(outcome.successful.len(), 1);
    let track = &outcome.successful[0];
    assert_eq!(track.title, "Never Gonna Give You Up");
    assert_eq!(track.encoded_id, "QAAAjQIAJVJpY2sgQXN0bGV5");
    assert_eq!(track.source_provider, Provider::Youtube);
    assert_eq!(track.origin_node.as_deref(), Some("rest"));
}
