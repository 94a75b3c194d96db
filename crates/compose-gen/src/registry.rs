//! Static registry of supported infrastructure services.
//!
//! Each entry knows how to contribute one (or more) service definitions to a
//! compose spec. Requesting an identifier that is not registered is a fatal
//! configuration error surfaced before anything is written to disk.

use serde_yaml::Value;

use crate::ComposeGenError;

/// Identifiers accepted by the `services` option, in registry order.
pub const KNOWN_SERVICES: [&str; 8] = [
    "redis",
    "redisSentinel",
    "redisCluster",
    "postgres",
    "rabbitmq",
    "elasticsearch",
    "cassandra",
    "couchdb",
];

/// A service definition contributed to the compose spec: the service key as
/// it appears under `services:` plus its default descriptor.
#[derive(Debug)]
pub struct ServiceTemplate {
    pub key: &'static str,
    pub descriptor: Value,
}

fn yaml(text: &str) -> Value {
    serde_yaml::from_str(text).expect("static service template must parse")
}

/// Resolve a requested identifier into its default service definitions.
///
/// `redisSentinel` expands to two services since the sentinel needs a plain
/// redis to monitor. `sentinel_entrypoint` is the host path of the packaged
/// sentinel bootstrap script.
pub fn resolve(
    identifier: &str,
    sentinel_entrypoint: &str,
) -> Result<Vec<ServiceTemplate>, ComposeGenError> {
    let templates = match identifier {
        "redis" => vec![redis()],
        "redisSentinel" => vec![redis(), redis_sentinel(sentinel_entrypoint)],
        "redisCluster" => vec![ServiceTemplate {
            key: "redis-cluster",
            descriptor: yaml(
                r#"
                image: makeomatic/redis-cluster:5-alpine
                hostname: redis-cluster
                "#,
            ),
        }],
        "postgres" => vec![ServiceTemplate {
            key: "postgres",
            descriptor: yaml(
                r#"
                image: postgres:14-alpine
                hostname: postgres
                environment:
                  POSTGRES_HOST_AUTH_METHOD: trust
                "#,
            ),
        }],
        "rabbitmq" => vec![ServiceTemplate {
            key: "rabbitmq",
            descriptor: yaml(
                r#"
                image: rabbitmq:3-management-alpine
                hostname: rabbitmq
                "#,
            ),
        }],
        "elasticsearch" => vec![ServiceTemplate {
            key: "elasticsearch",
            descriptor: yaml(
                r#"
                image: elasticsearch:7.14.2
                hostname: elasticsearch
                expose:
                  - "9200"
                  - "9300"
                environment:
                  ES_JAVA_OPTS: -Xms128m -Xmx128m
                  discovery.type: single-node
                  http.host: 0.0.0.0
                  transport.host: 127.0.0.1
                  xpack.security.enabled: "false"
                ulimits:
                  memlock:
                    soft: -1
                    hard: -1
                  nofile:
                    soft: 65536
                    hard: 65536
                cap_add:
                  - IPC_LOCK
                "#,
            ),
        }],
        "cassandra" => vec![ServiceTemplate {
            key: "cassandra",
            descriptor: yaml(
                r#"
                image: cassandra:3.11
                hostname: cassandra
                environment:
                  MAX_HEAP_SIZE: 128m
                  HEAP_NEWSIZE: 24m
                "#,
            ),
        }],
        "couchdb" => vec![ServiceTemplate {
            key: "couchdb",
            descriptor: yaml(
                r#"
                image: couchdb:2
                hostname: couchdb
                environment:
                  COUCHDB_USER: admin
                  COUCHDB_PASSWORD: admin
                  COUCHDB_SECRET: secret
                  NODENAME: docker
                "#,
            ),
        }],
        other => {
            return Err(ComposeGenError::UnknownService {
                identifier: other.to_string(),
            })
        }
    };

    Ok(templates)
}

fn redis() -> ServiceTemplate {
    ServiceTemplate {
        key: "redis",
        descriptor: yaml(
            r#"
            image: redis:6-alpine
            hostname: redis
            expose:
              - "6379"
            "#,
        ),
    }
}

fn redis_sentinel(entrypoint: &str) -> ServiceTemplate {
    let mut descriptor = yaml(
        r#"
        image: redis:6-alpine
        hostname: redis-sentinel
        expose:
          - "26379"
        depends_on:
          - redis
        command: /bin/sh /entrypoint.sh redis
        "#,
    );

    if let Value::Mapping(map) = &mut descriptor {
        map.insert(
            Value::from("volumes"),
            Value::Sequence(vec![Value::from(format!("{entrypoint}:/entrypoint.sh:ro"))]),
        );
    }

    ServiceTemplate {
        key: "redis-sentinel",
        descriptor,
    }
}
