//! Link descriptor grammar through the public API.

use access_reconciler::assignment::PrincipalType;
use access_reconciler::link::{Link, LinkDescriptor, Scope, ScopeType};

#[test]
fn descriptor_round_trips_every_scope_type() {
    for descriptor in [
        "account.123456789012.ReadOnly.Engineers.ssofile",
        "ou_id.ou-ab12-cdefgh34.ReadOnly.Engineers.ssofile",
        "root.all.Admin+Ops.Site Reliability.ssofile",
        "account_tag.cost-center^r=d.Billing,Read.finance_team.ssofile",
    ] {
        let parsed: LinkDescriptor = descriptor.parse().unwrap();
        assert_eq!(parsed.to_string(), descriptor);
    }
}

#[test]
fn link_exposes_descriptor_parts() {
    let link = Link::parse(
        "account_tag.env^prod.ReadOnly.jane.doe@example.com.ssofile",
        PrincipalType::User,
    )
    .unwrap();

    assert_eq!(link.scope().scope_type(), ScopeType::AccountTag);
    assert_eq!(link.scope().value(), "env^prod");
    assert_eq!(link.permission_set_name(), "ReadOnly");
    assert_eq!(link.principal_name(), "jane.doe@example.com");
    assert_eq!(link.principal_type, PrincipalType::User);
}

#[test]
fn built_descriptor_is_validated() {
    let ok = LinkDescriptor::new(
        Scope::Ou {
            ou_id: "ou-ab12-cdefgh34".into(),
        },
        "ReadOnly",
        "Engineers",
    );
    assert!(ok.is_ok());

    let bad = LinkDescriptor::new(Scope::Root, "Read.Only", "Engineers");
    assert!(bad.is_err());
}

#[test]
fn delimiter_only_allowed_in_principal() {
    assert!("account.123456789012.Read.Only.Engineers.ssofile"
        .parse::<LinkDescriptor>()
        .map(|d| d.principal_name == "Only.Engineers")
        .unwrap_or(false));
    assert!("account_tag.a.b^c.ReadOnly.Engineers.ssofile"
        .parse::<LinkDescriptor>()
        .is_err());
}

#[test]
fn link_json_defaults_to_group() {
    let link: Link = serde_json::from_str(
        r#"{"descriptor":"account.123456789012.ReadOnly.Engineers.ssofile"}"#,
    )
    .unwrap();
    assert_eq!(link.principal_type, PrincipalType::Group);
}
