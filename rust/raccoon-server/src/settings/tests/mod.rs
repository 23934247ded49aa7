use std::{net::SocketAddr, str::FromStr};

use tracing_subscriber::filter::EnvFilter;
use validator::Validate;

use super::*;

fn group(name: &str, input_dim: usize, output_dim: usize) -> GroupSettings {
    GroupSettings {
        name: name.to_string(),
        input_dim,
        output_dim,
    }
}

fn settings(groups: Vec<GroupSettings>) -> Settings {
    Settings {
        api: ApiSettings {
            bind_address: SocketAddr::from_str("127.0.0.1:5000").unwrap(),
        },
        log: LoggingSettings {
            filter: EnvFilter::new("info"),
        },
        coordinator: CoordinatorSettings::default(),
        model: ModelSettings::default(),
        client: ClientSettings::default(),
        groups,
    }
}

#[test]
fn test_settings_new() {
    let settings = Settings::new("../../configs/config.toml").unwrap();
    let names = settings
        .groups
        .iter()
        .map(|group| group.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["income", "credit", "lsd", "smoking"]);
    assert_eq!(settings.groups[1], group("credit", 23, 3));
    assert!(settings.coordinator.reject_non_finite);
    assert_eq!(settings.model.hidden, vec![64, 32]);

    assert!(Settings::new("").is_err());
}

#[test]
fn test_validate_groups() {
    assert!(settings(vec![group("income", 14, 2), group("credit", 23, 3)])
        .validate()
        .is_ok());

    // at least one group
    assert!(settings(Vec::new()).validate().is_err());

    // names
    assert!(settings(vec![group("income", 14, 2), group("income", 23, 3)])
        .validate()
        .is_err());
    assert!(settings(vec![group(" ", 14, 2)]).validate().is_err());

    // dimensions
    assert!(settings(vec![group("income", 0, 2)]).validate().is_err());
    assert!(settings(vec![group("income", 14, 0)]).validate().is_err());
}

#[test]
fn test_validate_client() {
    let mut settings = settings(vec![group("income", 14, 2)]);
    settings.client.noise_std = 0.;
    assert!(settings.validate().is_ok());
    settings.client.noise_std = -0.5;
    assert!(settings.validate().is_err());
    settings.client.noise_std = f32::INFINITY;
    assert!(settings.validate().is_err());
    settings.client.noise_std = f32::NAN;
    assert!(settings.validate().is_err());
}

#[test]
fn test_model_initializer() {
    let model = ModelSettings {
        hidden: vec![8],
        seed: Some(1),
    };
    let initializer = DenseInitializer::from(&model);
    assert_eq!(initializer.hidden(), &[8]);
}
