//! Request dispatch: the static table of recognised RPC methods and the
//! bridging of each method onto supervisor commands or historian calls.
//!
//! Handlers run on the transport task, never on the supervisor; anything
//! touching shared state goes through a supervisor command, and the
//! synchronous read/write flavours race their reply against the request's
//! timeout (the losing operation is not cancelled).

use crate::error::{MediatorError, Result};
use crate::network::protocol::{self as p, Codec};
use crate::supervisor::{SupervisorCommand as C, SupervisorHandle};
use crate::values::Timestamp;
use std::future::Future;
use std::time::Duration;

/// One entry of the request table.
pub struct RequestDef {
    pub name: &'static str,
    /// Accepted while module startup is still in progress.
    pub allowed_while_starting: bool,
    /// Opted into the binary codec (symmetric bincode encoding).
    pub binary: bool,
}

const fn def(name: &'static str, allowed_while_starting: bool, binary: bool) -> RequestDef {
    RequestDef {
        name,
        allowed_while_starting,
        binary,
    }
}

/// Every recognised RPC method. Paths not in this table are rejected with
/// `BadRequest`.
pub static REQUESTS: &[RequestDef] = &[
    // Authentication
    def("Login", true, true),
    def("Authenticate", true, true),
    def("Logout", true, true),
    // Discovery
    def("GetLoginUser", false, true),
    def("GetModules", false, false),
    def("GetLocations", false, false),
    def("GetMetaInfos", false, false),
    def("GetAllObjects", false, false),
    def("GetAllObjectsOfType", false, false),
    def("GetAllObjectsWithVariablesOfType", false, false),
    def("GetObjectsByID", false, false),
    def("GetObjectValuesByID", false, true),
    def("GetChildrenOfObjects", false, false),
    def("GetParentOfObject", false, false),
    def("GetRootObject", false, false),
    def("GetMemberValues", false, false),
    def("BrowseObjectMemberValues", false, false),
    // Data
    def("ReadVariables", false, true),
    def("ReadVariablesIgnoreMissing", false, true),
    def("ReadVariablesSync", false, true),
    def("ReadVariablesSyncIgnoreMissing", false, true),
    def("WriteVariables", false, true),
    def("WriteVariablesIgnoreMissing", false, true),
    def("WriteVariablesSync", false, true),
    def("WriteVariablesSyncIgnoreMissing", false, true),
    def("ReadAllVariablesOfObjectTree", false, true),
    // History
    def("HistorianCount", false, true),
    def("HistorianReadRaw", false, true),
    def("HistorianModify", false, true),
    def("HistorianDeleteInterval", false, true),
    def("HistorianDeleteVariables", false, true),
    def("HistorianDeleteAllVariablesOfObjectTree", false, true),
    def("HistorianGetLatestTimestampDB", false, true),
    // Config
    def("UpdateConfig", false, false),
    // Events
    def("EnableAlarmsAndEvents", false, true),
    def("DisableAlarmsAndEvents", false, true),
    def("EnableConfigChangedEvents", false, true),
    def("EnableVariableHistoryChangedEvents", false, true),
    def("EnableVariableValueChangedEvents", false, true),
    def("DisableChangeEvents", false, true),
    // Other
    def("CallMethod", false, false),
];

pub fn lookup(method: &str) -> Option<&'static RequestDef> {
    REQUESTS.iter().find(|d| d.name == method)
}

/// Races a reply future against the request's optional timeout. On timer
/// win the caller gets `Timeout`; the underlying operation runs on.
async fn race_timeout<T>(
    timeout_ms: Option<u64>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), fut)
            .await
            .map_err(|_| MediatorError::Timeout(format!("no completion within {ms} ms")))?,
        None => fut.await,
    }
}

/// Validates the session for requests served outside the supervisor
/// (historian calls).
async fn check_session(handle: &SupervisorHandle, session: String) -> Result<()> {
    handle
        .command(|reply| C::GetLoginUser { session, reply })
        .await
        .map(|_| ())
}

/// Decodes, executes and encodes one RPC call. `codec_in` is chosen by the
/// request's content type, `codec_out` by its `Accept` header.
pub async fn dispatch(
    handle: &SupervisorHandle,
    method: &str,
    codec_in: Codec,
    codec_out: Codec,
    body: &[u8],
) -> Result<Vec<u8>> {
    let def = lookup(method)
        .ok_or_else(|| MediatorError::request(format!("unknown request '{method}'")))?;
    if handle.is_starting() && !def.allowed_while_starting {
        return Err(MediatorError::ServiceUnavailable);
    }
    if (codec_in == Codec::Binary || codec_out == Codec::Binary) && !def.binary {
        return Err(MediatorError::request(format!(
            "request '{method}' does not support the binary codec"
        )));
    }

    match def.name {
        "Login" => {
            let params: p::LoginParams = codec_in.decode(body)?;
            let resp = handle
                .command(|reply| C::Login {
                    login: params.login,
                    is_module: params.is_module,
                    reply,
                })
                .await?;
            codec_out.encode(&resp)
        }
        "Authenticate" => {
            let params: p::AuthenticateParams = codec_in.decode(body)?;
            let user = handle
                .command(|reply| C::Authenticate {
                    session: params.session,
                    hash: params.hash,
                    reply,
                })
                .await?;
            codec_out.encode(&p::AuthenticateResponse { user })
        }
        "Logout" => {
            let params: p::SessionParams = codec_in.decode(body)?;
            handle
                .command(|reply| C::Logout {
                    session: params.session,
                    reply,
                })
                .await?;
            codec_out.encode(&())
        }
        "GetLoginUser" => {
            let params: p::SessionParams = codec_in.decode(body)?;
            let user = handle
                .command(|reply| C::GetLoginUser {
                    session: params.session,
                    reply,
                })
                .await?;
            codec_out.encode(&user)
        }

        "GetModules" => {
            let params: p::SessionParams = codec_in.decode(body)?;
            let modules = handle
                .command(|reply| C::GetModules {
                    session: params.session,
                    reply,
                })
                .await?;
            codec_out.encode(&modules)
        }
        "GetLocations" => {
            let params: p::SessionParams = codec_in.decode(body)?;
            let locations = handle
                .command(|reply| C::GetLocations {
                    session: params.session,
                    reply,
                })
                .await?;
            codec_out.encode(&locations)
        }
        "GetMetaInfos" => {
            let params: p::ModuleParams = codec_in.decode(body)?;
            let meta = handle
                .command(|reply| C::GetMetaInfos {
                    session: params.session,
                    module_id: params.module_id,
                    reply,
                })
                .await?;
            codec_out.encode(&meta)
        }
        "GetAllObjects" => {
            let params: p::ModuleParams = codec_in.decode(body)?;
            let objects = handle
                .command(|reply| C::GetAllObjects {
                    session: params.session,
                    module_id: params.module_id,
                    reply,
                })
                .await?;
            codec_out.encode(&objects)
        }
        "GetAllObjectsOfType" => {
            let params: p::TypeParams = codec_in.decode(body)?;
            let objects = handle
                .command(|reply| C::GetAllObjectsOfType {
                    session: params.session,
                    module_id: params.module_id,
                    type_name: params.type_name,
                    reply,
                })
                .await?;
            codec_out.encode(&objects)
        }
        "GetAllObjectsWithVariablesOfType" => {
            let params: p::TypeParams = codec_in.decode(body)?;
            let objects = handle
                .command(|reply| C::GetAllObjectsWithVariablesOfType {
                    session: params.session,
                    module_id: params.module_id,
                    type_name: params.type_name,
                    reply,
                })
                .await?;
            codec_out.encode(&objects)
        }
        "GetObjectsByID" => {
            let params: p::ObjectsParams = codec_in.decode(body)?;
            let objects = handle
                .command(|reply| C::GetObjectsByID {
                    session: params.session,
                    objects: params.objects,
                    reply,
                })
                .await?;
            codec_out.encode(&objects)
        }
        "GetObjectValuesByID" => {
            let params: p::ObjectsParams = codec_in.decode(body)?;
            let values = handle
                .command(|reply| C::GetObjectValuesByID {
                    session: params.session,
                    objects: params.objects,
                    reply,
                })
                .await?;
            codec_out.encode(&values)
        }
        "GetChildrenOfObjects" => {
            let params: p::ObjectsParams = codec_in.decode(body)?;
            let objects = handle
                .command(|reply| C::GetChildrenOfObjects {
                    session: params.session,
                    objects: params.objects,
                    reply,
                })
                .await?;
            codec_out.encode(&objects)
        }
        "GetParentOfObject" => {
            let params: p::ObjectParams = codec_in.decode(body)?;
            let parent = handle
                .command(|reply| C::GetParentOfObject {
                    session: params.session,
                    object: params.object,
                    reply,
                })
                .await?;
            codec_out.encode(&parent)
        }
        "GetRootObject" => {
            let params: p::ModuleParams = codec_in.decode(body)?;
            let root = handle
                .command(|reply| C::GetRootObject {
                    session: params.session,
                    module_id: params.module_id,
                    reply,
                })
                .await?;
            codec_out.encode(&root)
        }
        "GetMemberValues" | "BrowseObjectMemberValues" => {
            let params: p::MemberValuesParams = codec_in.decode(body)?;
            let members = handle
                .command(|reply| C::GetMemberValues {
                    session: params.session,
                    object: params.object,
                    members: params.members,
                    reply,
                })
                .await?;
            codec_out.encode(&members)
        }

        "ReadVariables" => {
            let params: p::ReadParams = codec_in.decode(body)?;
            let values = handle
                .command(|reply| C::ReadVariables {
                    session: params.session,
                    variables: params.variables,
                    reply,
                })
                .await?;
            codec_out.encode(&values)
        }
        "ReadVariablesIgnoreMissing" => {
            let params: p::ReadParams = codec_in.decode(body)?;
            let values = handle
                .command(|reply| C::ReadVariablesIgnoreMissing {
                    session: params.session,
                    variables: params.variables,
                    reply,
                })
                .await?;
            codec_out.encode(&values)
        }
        "ReadVariablesSync" | "ReadVariablesSyncIgnoreMissing" => {
            let params: p::ReadParams = codec_in.decode(body)?;
            let ignore_missing = def.name.ends_with("IgnoreMissing");
            let timeout_ms = params.timeout_ms;
            let values = race_timeout(
                timeout_ms,
                handle.command(|reply| C::ReadVariablesSync {
                    session: params.session,
                    variables: params.variables,
                    ignore_missing,
                    reply,
                }),
            )
            .await?;
            codec_out.encode(&values)
        }
        "ReadAllVariablesOfObjectTree" => {
            let params: p::ObjectParams = codec_in.decode(body)?;
            let values = handle
                .command(|reply| C::ReadAllVariablesOfObjectTree {
                    session: params.session,
                    root: params.object,
                    reply,
                })
                .await?;
            codec_out.encode(&values)
        }
        "WriteVariables" | "WriteVariablesIgnoreMissing" | "WriteVariablesSync"
        | "WriteVariablesSyncIgnoreMissing" => {
            let params: p::WriteParams = codec_in.decode(body)?;
            let ignore_missing = def.name.ends_with("IgnoreMissing");
            let sync = def.name.starts_with("WriteVariablesSync");
            let timeout_ms = params.timeout_ms;
            let result = race_timeout(
                timeout_ms,
                handle.command(|reply| C::WriteVariables {
                    session: params.session,
                    values: params.values,
                    ignore_missing,
                    sync,
                    reply,
                }),
            )
            .await?;
            codec_out.encode(&result)
        }

        "HistorianCount" => {
            let params: p::HistorianCountParams = codec_in.decode(body)?;
            check_session(handle, params.session).await?;
            let count = handle
                .historian
                .count(params.variable, params.start_time, params.end_time, params.filter)
                .await?;
            codec_out.encode(&count)
        }
        "HistorianReadRaw" => {
            let params: p::HistorianReadRawParams = codec_in.decode(body)?;
            check_session(handle, params.session).await?;
            let rows = handle
                .historian
                .read_raw(
                    params.variable,
                    params.start_time,
                    params.end_time,
                    params.max_values,
                    params.bounding,
                    params.filter,
                )
                .await?;
            codec_out.encode(&rows)
        }
        "HistorianModify" => {
            let params: p::HistorianModifyParams = codec_in.decode(body)?;
            check_session(handle, params.session).await?;
            handle
                .historian
                .modify(params.variable, params.mode, params.data)
                .await?;
            codec_out.encode(&())
        }
        "HistorianDeleteInterval" => {
            let params: p::HistorianDeleteIntervalParams = codec_in.decode(body)?;
            check_session(handle, params.session).await?;
            let deleted = handle
                .historian
                .delete_interval(params.variable, params.start_time, params.end_time)
                .await?;
            codec_out.encode(&deleted)
        }
        "HistorianDeleteVariables" => {
            let params: p::HistorianDeleteVariablesParams = codec_in.decode(body)?;
            check_session(handle, params.session).await?;
            handle.historian.delete_variables(params.variables).await?;
            codec_out.encode(&())
        }
        "HistorianDeleteAllVariablesOfObjectTree" => {
            let params: p::ObjectParams = codec_in.decode(body)?;
            // The tree's declared variables come from the supervisor; the
            // channels are then dropped on the owning worker.
            let values = handle
                .command(|reply| C::ReadAllVariablesOfObjectTree {
                    session: params.session,
                    root: params.object,
                    reply,
                })
                .await?;
            let refs = values.into_iter().map(|vv| vv.variable).collect();
            handle.historian.delete_variables(refs).await?;
            codec_out.encode(&())
        }
        "HistorianGetLatestTimestampDB" => {
            let params: p::HistorianVariableParams = codec_in.decode(body)?;
            check_session(handle, params.session).await?;
            let latest: Option<Timestamp> =
                handle.historian.latest_timestamp_db(params.variable).await?;
            codec_out.encode(&latest)
        }

        "UpdateConfig" => {
            let params: p::UpdateConfigParams = codec_in.decode(body)?;
            handle
                .command(|reply| C::UpdateConfig {
                    session: params.session,
                    module_id: params.module_id,
                    patch: params.patch,
                    reply,
                })
                .await?;
            codec_out.encode(&())
        }

        "EnableAlarmsAndEvents" => {
            let params: p::EnableAlarmsParams = codec_in.decode(body)?;
            handle
                .command(|reply| C::EnableAlarmsAndEvents {
                    session: params.session,
                    min_severity: params.min_severity,
                    reply,
                })
                .await?;
            codec_out.encode(&())
        }
        "DisableAlarmsAndEvents" => {
            let params: p::SessionParams = codec_in.decode(body)?;
            handle
                .command(|reply| C::DisableAlarmsAndEvents {
                    session: params.session,
                    reply,
                })
                .await?;
            codec_out.encode(&())
        }
        "EnableConfigChangedEvents" => {
            let params: p::EnableConfigChangedParams = codec_in.decode(body)?;
            handle
                .command(|reply| C::EnableConfigChangedEvents {
                    session: params.session,
                    objects: params.objects,
                    reply,
                })
                .await?;
            codec_out.encode(&())
        }
        "EnableVariableHistoryChangedEvents" => {
            let params: p::SessionParams = codec_in.decode(body)?;
            handle
                .command(|reply| C::EnableVariableHistoryChangedEvents {
                    session: params.session,
                    reply,
                })
                .await?;
            codec_out.encode(&())
        }
        "EnableVariableValueChangedEvents" => {
            let params: p::EnableVarValueParams = codec_in.decode(body)?;
            handle
                .command(|reply| C::EnableVariableValueChangedEvents {
                    session: params.session,
                    options: params.options,
                    variables: params.variables,
                    roots: params.roots,
                    reply,
                })
                .await?;
            codec_out.encode(&())
        }
        "DisableChangeEvents" => {
            let params: p::DisableChangeEventsParams = codec_in.decode(body)?;
            handle
                .command(|reply| C::DisableChangeEvents {
                    session: params.session,
                    variables: params.variables,
                    history: params.history,
                    config: params.config,
                    reply,
                })
                .await?;
            codec_out.encode(&())
        }

        "CallMethod" => {
            let params: p::CallMethodParams = codec_in.decode(body)?;
            let result = handle
                .command(|reply| C::CallMethod {
                    session: params.session,
                    module_id: params.module_id,
                    method_name: params.method_name,
                    parameters: params.parameters,
                    reply,
                })
                .await?;
            codec_out.encode(&result)
        }

        other => Err(MediatorError::internal(format!(
            "request '{other}' is in the table but unhandled"
        ))),
    }
}
