use std::time::Duration;

use dialoguer::{Input, Password};
use neex_cache::{ArtifactCache, RemoteCache, RemoteCacheConfig};

use crate::{run::remote_config_path, Error};

pub async fn cache(
    status: bool,
    s3: bool,
    r2: bool,
    clear: bool,
    clean: bool,
    max_age_days: u64,
) -> Result<i32, Error> {
    let repo_root = crate::repo_root()?;
    let config_path = remote_config_path(&repo_root);

    if clean {
        let cache = ArtifactCache::new(&repo_root.join(".neex/cache"), None);
        let max_age = Duration::from_secs(max_age_days * 24 * 60 * 60);
        let removed = cache.cleanup(max_age)?;
        println!("removed {removed} artifacts older than {max_age_days} days");
        return Ok(0);
    }

    if clear {
        if RemoteCacheConfig::clear(&config_path)? {
            println!("remote cache configuration removed");
        } else {
            println!("no remote cache configured");
        }
        return Ok(0);
    }

    if s3 || r2 {
        let provider = if r2 { "r2" } else { "s3" };
        let config = prompt_config(provider)?;
        config.save(&config_path)?;
        println!("remote cache configured ({provider})");
        return Ok(0);
    }

    if status {
        print_status(&repo_root, &config_path).await;
        return Ok(0);
    }

    println!("nothing to do: pass --status, --s3, --r2, --clean, or --clear");
    Ok(0)
}

fn prompt_config(provider: &str) -> Result<RemoteCacheConfig, Error> {
    let endpoint: String = Input::new()
        .with_prompt("Endpoint URL")
        .interact_text()?;
    let bucket: String = Input::new()
        .with_prompt("Bucket")
        .interact_text()?;
    let access_key: String = Input::new()
        .with_prompt("Access key id")
        .interact_text()?;
    let secret_key: String = Password::new()
        .with_prompt("Secret access key")
        .interact()?;
    let default_region = if provider == "r2" { "auto" } else { "us-east-1" };
    let region: String = Input::new()
        .with_prompt("Region")
        .default(default_region.to_string())
        .interact_text()?;

    Ok(RemoteCacheConfig {
        provider: provider.to_string(),
        endpoint,
        bucket,
        access_key,
        secret_key,
        region,
    })
}

async fn print_status(repo_root: &camino::Utf8Path, config_path: &camino::Utf8Path) {
    let cache_dir = repo_root.join(".neex/cache");
    let artifacts = count_entries(&cache_dir.join("artifacts"));
    let objects = count_objects(&cache_dir.join("objects"));
    println!("local cache: {artifacts} artifacts, {objects} content objects");
    println!("  location: {cache_dir}");

    match RemoteCacheConfig::load(config_path) {
        None => println!("remote cache: not configured"),
        Some(config) => {
            let provider = config.provider.clone();
            let endpoint = config.endpoint.clone();
            match RemoteCache::new(config) {
                Ok(remote) => {
                    let reachable = remote.check_connection().await;
                    let health = if reachable { "reachable" } else { "unreachable" };
                    println!("remote cache: {provider} at {endpoint} ({health})");
                }
                Err(e) => println!("remote cache: misconfigured ({e})"),
            }
        }
    }
}

fn count_entries(dir: &camino::Utf8Path) -> usize {
    dir.read_dir_utf8()
        .map(|entries| entries.flatten().count())
        .unwrap_or(0)
}

fn count_objects(objects_dir: &camino::Utf8Path) -> usize {
    let Ok(shards) = objects_dir.read_dir_utf8() else {
        return 0;
    };
    shards
        .flatten()
        .filter_map(|shard| shard.path().read_dir_utf8().ok())
        .map(|objects| objects.flatten().count())
        .sum()
}
