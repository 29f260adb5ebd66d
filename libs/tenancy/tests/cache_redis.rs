#![allow(clippy::unwrap_used, clippy::expect_used)]
#![cfg(feature = "integration")]

//! `CacheManager` and `CacheHelper` against a Redis container.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tenancy::{
    CacheConfig, CacheConnOptions, CacheHelper, CacheManager, Json, ScoredMember, TenantCtx,
    TenantError, TenantId,
};

struct RedisUnderTest {
    url: String,
    _container: ContainerAsync<Redis>,
}

async fn bring_up_redis() -> Result<RedisUnderTest> {
    let container = Redis::default().start().await?;
    let port = container.get_host_port_ipv4(6379).await?;
    Ok(RedisUnderTest {
        url: format!("redis://127.0.0.1:{port}"),
        _container: container,
    })
}

async fn helper_for(rut: &RedisUnderTest) -> Result<CacheHelper> {
    let manager = CacheManager::new(CacheConfig {
        default_options: CacheConnOptions::from_url(format!("{}/0", rut.url)),
        ..Default::default()
    })
    .await?;
    Ok(CacheHelper::new(Arc::new(manager)))
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Profile {
    id: u32,
    name: String,
}

#[tokio::test]
async fn tenant_clients_and_prefixes() -> Result<()> {
    let rut = bring_up_redis().await?;
    let mut tenant_options = HashMap::new();
    tenant_options.insert(
        TenantId::from("a"),
        CacheConnOptions {
            db: Some(1),
            ..CacheConnOptions::from_url(format!("{}/0", rut.url))
        },
    );
    let manager = CacheManager::new(CacheConfig {
        default_options: CacheConnOptions::from_url(format!("{}/0", rut.url)),
        tenant_options,
        ..Default::default()
    })
    .await?;

    let a = manager.get_client("a");
    let default = manager.get_client("");
    assert!(!Arc::ptr_eq(&a, &default));
    assert!(Arc::ptr_eq(&a, &manager.get_client_from_context(&TenantCtx::for_tenant("a"))));
    // Undeclared tenants share the default client.
    assert!(Arc::ptr_eq(&default, &manager.get_client("zzz")));

    assert_eq!(manager.with_tenant_prefix(&TenantCtx::for_tenant("a"), "k"), "a:k");
    assert_eq!(manager.with_tenant_prefix(&TenantCtx::anonymous(), "k"), "k");

    manager.close().await?;
    manager.close().await?;
    Ok(())
}

#[tokio::test]
async fn isolation_can_be_disabled() -> Result<()> {
    let rut = bring_up_redis().await?;
    let manager = CacheManager::new(CacheConfig {
        default_options: CacheConnOptions::from_url(rut.url.clone()),
        tenant_isolation: false,
        separator: "|".to_owned(),
        ..Default::default()
    })
    .await?;
    assert_eq!(manager.with_tenant_prefix(&TenantCtx::for_tenant("a"), "k"), "k");
    Ok(())
}

#[tokio::test]
async fn unreachable_tenant_client_fails_construction() -> Result<()> {
    let rut = bring_up_redis().await?;
    let mut tenant_options = HashMap::new();
    tenant_options.insert(
        TenantId::from("gone"),
        CacheConnOptions::from_url("redis://127.0.0.1:1/0"),
    );
    let err = CacheManager::new(CacheConfig {
        default_options: CacheConnOptions::from_url(rut.url.clone()),
        tenant_options,
        ping_timeout: Duration::from_millis(500),
        ..Default::default()
    })
    .await
    .unwrap_err();

    match err {
        TenantError::ConnectionFailed { tenant, .. } => assert_eq!(tenant.as_str(), "gone"),
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn values_are_written_under_the_tenant_prefix() -> Result<()> {
    let rut = bring_up_redis().await?;
    let helper = helper_for(&rut).await?;
    let acme = TenantCtx::for_tenant("acme");

    helper.set(&acme, "greeting", "hello", Duration::ZERO).await?;
    assert_eq!(helper.get(&acme, "greeting").await?.as_deref(), Some("hello"));
    assert_eq!(helper.get(&TenantCtx::anonymous(), "greeting").await?, None);

    let mut raw = helper.manager().get_client("").connection()?;
    let stored: Option<String> = raw.get("acme:greeting").await?;
    assert_eq!(stored.as_deref(), Some("hello"));
    Ok(())
}

#[tokio::test]
async fn typed_values_round_trip_through_json() -> Result<()> {
    let rut = bring_up_redis().await?;
    let helper = helper_for(&rut).await?;
    let ctx = TenantCtx::for_tenant("acme");
    let profile = Profile {
        id: 7,
        name: "ada".to_owned(),
    };

    helper
        .set(&ctx, "profile", &Json(&profile), Duration::from_secs(60))
        .await?;
    let loaded: Option<Profile> = helper.get_object(&ctx, "profile").await?;
    assert_eq!(loaded, Some(profile));

    let missing: Option<Profile> = helper.get_object(&ctx, "nope").await?;
    assert!(missing.is_none());

    helper.set(&ctx, "not-json", "{{{", Duration::ZERO).await?;
    let err = helper.get_object::<Profile>(&ctx, "not-json").await.unwrap_err();
    assert!(matches!(err, TenantError::Serialization { .. }));
    Ok(())
}

#[tokio::test]
async fn key_operations() -> Result<()> {
    let rut = bring_up_redis().await?;
    let helper = helper_for(&rut).await?;
    let ctx = TenantCtx::for_tenant("acme");

    assert_eq!(helper.incr(&ctx, "visits").await?, 1);
    assert_eq!(helper.incr(&ctx, "visits").await?, 2);
    helper.set(&ctx, "counter", &40_i64, Duration::ZERO).await?;
    assert_eq!(helper.incr(&ctx, "counter").await?, 41);

    assert!(helper.exists(&ctx, "visits").await?);
    assert!(helper.expire(&ctx, "visits", Duration::from_millis(100)).await?);
    assert!(!helper.expire(&ctx, "ghost", Duration::from_secs(1)).await?);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!helper.exists(&ctx, "visits").await?);

    assert_eq!(helper.delete(&ctx, &["counter", "ghost"]).await?, 1);
    assert_eq!(helper.delete(&ctx, &[]).await?, 0);
    Ok(())
}

#[tokio::test]
async fn hash_list_set_and_sorted_set_operations() -> Result<()> {
    let rut = bring_up_redis().await?;
    let helper = helper_for(&rut).await?;
    let ctx = TenantCtx::for_tenant("acme");

    helper.hset(&ctx, "user", "name", "ada").await?;
    helper.hset(&ctx, "user", "age", &36_i64).await?;
    assert_eq!(helper.hget(&ctx, "user", "name").await?.as_deref(), Some("ada"));
    assert_eq!(helper.hget(&ctx, "user", "missing").await?, None);
    let all = helper.hget_all(&ctx, "user").await?;
    assert_eq!(all.get("age").map(String::as_str), Some("36"));
    assert_eq!(helper.hdel(&ctx, "user", &["age", "missing"]).await?, 1);

    assert_eq!(helper.rpush(&ctx, "queue", &["b", "c"]).await?, 2);
    assert_eq!(helper.lpush(&ctx, "queue", &["a"]).await?, 3);
    assert_eq!(helper.lrange(&ctx, "queue", 0, -1).await?, vec!["a", "b", "c"]);

    assert_eq!(helper.sadd(&ctx, "tags", &["x", "y", "x"]).await?, 2);
    let mut members = helper.smembers(&ctx, "tags").await?;
    members.sort();
    assert_eq!(members, vec!["x", "y"]);
    assert_eq!(helper.srem(&ctx, "tags", &["x"]).await?, 1);

    assert_eq!(
        helper
            .zadd(&ctx, "board", &[(3.0, "carol"), (1.0, "alice"), (2.0, "bob")])
            .await?,
        3
    );
    assert_eq!(
        helper.zrange(&ctx, "board", 0, 1).await?,
        vec!["alice", "bob"]
    );
    assert_eq!(
        helper.zrange_with_scores(&ctx, "board", -1, -1).await?,
        vec![ScoredMember {
            member: "carol".to_owned(),
            score: 3.0
        }]
    );
    assert_eq!(helper.zrem(&ctx, "board", &["bob"]).await?, 1);
    Ok(())
}

#[tokio::test]
async fn lock_is_exclusive_and_released_only_by_holder() -> Result<()> {
    let rut = bring_up_redis().await?;
    let helper = helper_for(&rut).await?;
    let ctx = TenantCtx::for_tenant("acme");
    let ttl = Duration::from_secs(30);

    assert!(helper.lock(&ctx, "job", "owner-1", ttl).await?);
    assert!(!helper.lock(&ctx, "job", "owner-2", ttl).await?);

    assert!(!helper.unlock(&ctx, "job", "owner-2").await?);
    assert!(helper.exists(&ctx, "lock:job").await?);

    assert!(helper.unlock(&ctx, "job", "owner-1").await?);
    assert!(!helper.exists(&ctx, "lock:job").await?);
    assert!(!helper.unlock(&ctx, "job", "owner-1").await?);

    assert!(helper.lock(&ctx, "job", "owner-2", ttl).await?);
    Ok(())
}

#[tokio::test]
async fn lock_expires_after_ttl() -> Result<()> {
    let rut = bring_up_redis().await?;
    let helper = helper_for(&rut).await?;
    let ctx = TenantCtx::for_tenant("acme");

    assert!(helper.lock(&ctx, "job", "slow", Duration::from_millis(100)).await?);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(helper.lock(&ctx, "job", "next", Duration::from_secs(5)).await?);
    // The expired holder cannot release the new holder's lock.
    assert!(!helper.unlock(&ctx, "job", "slow").await?);
    Ok(())
}

#[tokio::test]
async fn locks_are_namespaced_per_tenant() -> Result<()> {
    let rut = bring_up_redis().await?;
    let helper = helper_for(&rut).await?;
    let ttl = Duration::from_secs(30);

    assert!(helper.lock(&TenantCtx::for_tenant("a"), "job", "t", ttl).await?);
    assert!(helper.lock(&TenantCtx::for_tenant("b"), "job", "t", ttl).await?);
    assert!(!helper.lock(&TenantCtx::for_tenant("a"), "job", "u", ttl).await?);

    let err = helper
        .lock(&TenantCtx::anonymous(), "", "t", ttl)
        .await
        .unwrap_err();
    assert!(matches!(err, TenantError::EmptyIdentifier { .. }));
    Ok(())
}
