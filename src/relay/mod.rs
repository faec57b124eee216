
mod client;
mod service;

pub use client::{DirectRemote, RelayClient, RelayOptions, RelayRemote};
pub use service::RelayService;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;
    use crate::error::RelayError;
    use crate::protocol::ERR_DUPLICATE_TAB_ID;
    use crate::schema::Schema;
    use crate::transfer::Payload;

    fn counting_schema() -> Schema {
        Schema::new()
            .method("inc", |args: Vec<Value>, ctx| async move {
                let n = args[0].clone();
                ctx.peer.set_state("counter", n)?;
                Ok(Payload::new(Value::Null))
            })
            .data("counter", json!(0))
    }

    async fn join(
        relay: &RelayService,
        channel: &str,
        tab: &str,
        schema: Schema,
    ) -> RelayClient {
        RelayClient::connect(
            schema,
            RelayOptions::new()
                .with_relay(relay.connect())
                .with_channel(channel)
                .with_tab_id(tab),
        )
        .await
        .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_first_tab_seeds_shared_state() {
        let relay = RelayService::new();
        let t1 = join(&relay, "c", "t1", counting_schema()).await;
        assert_eq!(t1.remote().get("counter"), Some(json!(0)));

        // A later tab with different data leaves does not re-seed.
        let t2 = join(
            &relay,
            "c",
            "t2",
            counting_schema().data("counter", json!(99)).data("extra", json!(1)),
        )
        .await;
        assert_eq!(t2.remote().get("counter"), Some(json!(0)));
        assert_eq!(t2.remote().get("extra"), None);
    }

    #[tokio::test]
    async fn test_broadcast_state_convergence() {
        let relay = RelayService::new();
        let t1 = join(&relay, "c", "t1", counting_schema()).await;
        let t2 = join(&relay, "c", "t2", counting_schema()).await;
        let t3 = join(&relay, "c", "t3", counting_schema()).await;

        t1.remote().invoke("inc", vec![json!(5)]).await.unwrap();
        settle().await;

        assert_eq!(t1.remote().get("counter"), Some(json!(5)));
        assert_eq!(t2.remote().get("counter"), Some(json!(5)));
        assert_eq!(t3.remote().get("counter"), Some(json!(5)));
    }

    #[tokio::test]
    async fn test_no_cross_channel_talk() {
        let relay = RelayService::new();
        let t1 = join(&relay, "a", "t1", counting_schema()).await;
        let other = join(&relay, "b", "t1", counting_schema()).await;

        t1.remote().invoke("inc", vec![json!(7)]).await.unwrap();
        settle().await;

        assert_eq!(other.remote().get("counter"), Some(json!(0)));
        assert_eq!(relay.tabs_on("a"), vec!["t1"]);
        assert_eq!(relay.tabs_on("b"), vec!["t1"]);
    }

    #[tokio::test]
    async fn test_duplicate_tab_id_evicts_old_holder() {
        let relay = RelayService::new();
        let old = join(&relay, "c", "x", counting_schema()).await;
        assert!(old.eviction().is_none());

        let new = join(&relay, "c", "x", counting_schema()).await;
        settle().await;

        assert_eq!(old.eviction().as_deref(), Some(ERR_DUPLICATE_TAB_ID));
        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert_eq!(relay.tabs_on("c"), vec!["x"]);
    }

    #[tokio::test]
    async fn test_invalid_handshake_rejected() {
        let relay = RelayService::new();
        let err = RelayClient::connect(
            Schema::new(),
            RelayOptions::new()
                .with_relay(relay.connect())
                .with_tab_id(""),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RelayError::HandshakeRejected { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_drops_channel_when_last_tab_leaves() {
        let relay = RelayService::new();
        let t1 = join(&relay, "c", "t1", counting_schema()).await;
        assert_eq!(relay.channel_count(), 1);

        t1.close();
        t1.close();
        settle().await;
        assert_eq!(relay.channel_count(), 0);

        // A rejoin re-seeds from the newcomer's schema.
        let t2 = join(
            &relay,
            "c",
            "t2",
            Schema::new().data("counter", json!(42)),
        )
        .await;
        assert_eq!(t2.remote().get("counter"), Some(json!(42)));
    }

    #[tokio::test]
    async fn test_connected_tabs_roundtrip() {
        let relay = RelayService::new();
        let t1 = join(&relay, "m", "a", counting_schema()).await;
        let _t2 = join(&relay, "m", "b", counting_schema()).await;
        let tabs = t1.connected_tabs().await.unwrap();
        assert_eq!(tabs, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_fetch_state_refreshes_mirror() {
        let relay = RelayService::new();
        let t1 = join(&relay, "s", "a", Schema::new().data("k", json!("v"))).await;
        let state = t1.fetch_state().await.unwrap();
        assert_eq!(state, json!({ "k": "v" }));
    }

    #[tokio::test]
    async fn test_default_channel_sentinel() {
        let relay = RelayService::new();
        let client = RelayClient::connect(
            counting_schema(),
            RelayOptions::new().with_relay(relay.connect()),
        )
        .await
        .unwrap();
        assert_eq!(client.channel(), crate::protocol::DEFAULT_CHANNEL);
        assert_eq!(client.tab_id().len(), crate::protocol::ID_LEN);
    }
}
