use std::{fmt, marker::PhantomData, sync::Arc};

use cognito_gate::{AuthDecision, Group, GroupPolicy, RequestGate};
use http::{Request, Response};
use http_body::Body;
use tower_http::validate_request::{ValidateRequest, ValidateRequestHeaderLayer};

use crate::util::unauthorized;

/// Request validator that runs a [`RequestGate`] against the `Authorization`
/// header
///
/// On success the [`AuthorizedIdentity`][cognito_gate::AuthorizedIdentity]
/// and the raw [`Jwt`][aliri::Jwt] are inserted into the request extensions.
/// On failure the request is answered with an empty `401 Unauthorized`.
pub struct VerifyCognito<ResBody> {
    gate: RequestGate,
    policy: Arc<GroupPolicy>,
    _body: PhantomData<fn() -> ResBody>,
}

impl<ResBody> VerifyCognito<ResBody> {
    fn new(gate: RequestGate, policy: GroupPolicy) -> Self {
        Self {
            gate,
            policy: Arc::new(policy),
            _body: PhantomData,
        }
    }
}

impl<ResBody> Clone for VerifyCognito<ResBody> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
            policy: Arc::clone(&self.policy),
            _body: PhantomData,
        }
    }
}

impl<ResBody> fmt::Debug for VerifyCognito<ResBody> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VerifyCognito")
            .field("gate", &self.gate)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<ReqBody, ResBody> ValidateRequest<ReqBody> for VerifyCognito<ResBody>
where
    ResBody: Body + Default,
{
    type ResponseBody = ResBody;

    fn validate(
        &mut self,
        request: &mut Request<ReqBody>,
    ) -> Result<(), Response<Self::ResponseBody>> {
        let authorization = request
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        match self.gate.gate(authorization, &self.policy) {
            AuthDecision::Allowed { identity, token } => {
                let extensions = request.extensions_mut();
                let _ = extensions.insert(identity);
                let _ = extensions.insert(token);
                Ok(())
            }
            AuthDecision::Denied { .. } => Err(unauthorized()),
        }
    }
}

/// Builder for layers that gate routes on Cognito access tokens
#[derive(Clone, Debug)]
pub struct CognitoAuthorizer {
    gate: RequestGate,
}

impl CognitoAuthorizer {
    /// Builds layers around `gate`
    pub fn new(gate: RequestGate) -> Self {
        Self { gate }
    }

    /// Layer admitting any request bearing a valid token
    pub fn layer<ResBody>(&self) -> ValidateRequestHeaderLayer<VerifyCognito<ResBody>>
    where
        ResBody: Body + Default,
    {
        self.with_policy(GroupPolicy::allow_any())
    }

    /// Layer admitting requests whose access token lists any one of `groups`
    pub fn require_groups<ResBody, I>(
        &self,
        groups: I,
    ) -> ValidateRequestHeaderLayer<VerifyCognito<ResBody>>
    where
        ResBody: Body + Default,
        I: IntoIterator<Item = Group>,
    {
        self.with_policy(GroupPolicy::require_any_of(groups))
    }

    /// Layer admitting requests that satisfy `policy`
    pub fn with_policy<ResBody>(
        &self,
        policy: GroupPolicy,
    ) -> ValidateRequestHeaderLayer<VerifyCognito<ResBody>>
    where
        ResBody: Body + Default,
    {
        ValidateRequestHeaderLayer::custom(VerifyCognito::new(self.gate.clone(), policy))
    }
}
