use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;

/// Producer failures, bucketed by what the owning instance has to do about
/// them. The taxonomy is deliberately coarse: callers never see these
/// directly, they only shape the publisher's recovery path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProducerError {
    /// Another producer with the same transactional id took over this
    /// partition. Fatal to the instance; it must terminate.
    #[error("producer fenced by a newer instance: {0}")]
    Fenced(String),

    /// The client itself is unusable (authorization, protocol version,
    /// broker-fatal). Recreate the producer before retrying.
    #[error("producer must be rebuilt: {0}")]
    InitFatal(String),

    /// Everything else. Safe to retry with the same producer.
    #[error("transient produce failure: {0}")]
    Transient(String),
}

impl ProducerError {
    pub fn is_fenced(&self) -> bool {
        matches!(self, ProducerError::Fenced(_))
    }

    pub fn requires_rebuild(&self) -> bool {
        matches!(self, ProducerError::InitFatal(_))
    }
}

impl From<KafkaError> for ProducerError {
    fn from(err: KafkaError) -> Self {
        classify(&err)
    }
}

pub fn classify(err: &KafkaError) -> ProducerError {
    if let KafkaError::Transaction(e) = err {
        if is_fencing_code(e.code()) || e.is_fatal() {
            return ProducerError::Fenced(err.to_string());
        }
        return ProducerError::Transient(err.to_string());
    }

    match err.rdkafka_error_code() {
        Some(code) if is_fencing_code(code) => ProducerError::Fenced(err.to_string()),
        Some(
            RDKafkaErrorCode::UnsupportedVersion
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
            | RDKafkaErrorCode::TransactionalIdAuthorizationFailed
            | RDKafkaErrorCode::SaslAuthenticationFailed,
        ) => ProducerError::InitFatal(err.to_string()),
        _ => ProducerError::Transient(err.to_string()),
    }
}

fn is_fencing_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::Fenced
            | RDKafkaErrorCode::ProducerFenced
            | RDKafkaErrorCode::InvalidProducerEpoch
    )
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer closed")]
    Closed,
}
