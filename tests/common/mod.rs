#![allow(dead_code)]

use formcascade::{Form, FormConfig, FormDefinition};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

pub const HOUSEHOLD: &str = include_str!("../fixtures/household.xml");

pub const MEMBER: &str = "/household/member";

pub fn household_definition() -> FormDefinition {
    FormDefinition::from_xform(HOUSEHOLD).unwrap()
}

pub fn household(config: FormConfig) -> Form {
    Form::load(&household_definition(), None, config).unwrap()
}

pub fn definition(primary: &str) -> FormDefinition {
    FormDefinition {
        primary_instance: primary.to_string(),
        ..Default::default()
    }
}
