//! Administrative commands handled by the server itself.

use crate::dispatch::Builtin;
use crate::protocol::{Encore, RpcResponse};
use crate::registry::{ClientId, DestroyReason};
use crate::server::{ServerCore, StopReason};
use tracing::{info, warn};

impl ServerCore {
    pub(crate) fn run_builtin(&mut self, builtin: Builtin, id: ClientId, args: &str) -> RpcResponse {
        match builtin {
            Builtin::Quit => self.quit(id),
            Builtin::Who => self.who(id),
            Builtin::Shutdown => self.shutdown_command(id, args),
            Builtin::NewLog => self.newlog(id, args),
        }
    }

    fn quit(&mut self, id: ClientId) -> RpcResponse {
        self.registry.destroy(id, DestroyReason::Quit);
        if self.refuse_new && self.registry.active_count() == 0 {
            self.shutdown(StopReason::Operator, true);
        }
        RpcResponse::closed("// A bientot")
    }

    fn who(&self, id: ClientId) -> RpcResponse {
        let text = format!(
            "// {} active clients, {} transactions so far\n",
            self.registry.active_count(),
            self.registry.transactions()
        );
        RpcResponse::reply(id, text, Encore::Done)
    }

    fn shutdown_command(&mut self, id: ClientId, args: &str) -> RpcResponse {
        self.refuse_new = true;
        if args.eq_ignore_ascii_case("now") {
            info!(client_id = id, "Immediate shutdown requested");
            self.shutdown(StopReason::Operator, true);
            return RpcResponse::closed("// Server shutting down now");
        }
        info!(
            client_id = id,
            active = self.registry.active_count(),
            "Shutdown requested, refusing new clients"
        );
        RpcResponse::reply(
            id,
            "// No new clients accepted; the server exits once the last client has gone",
            Encore::Done,
        )
    }

    fn newlog(&mut self, id: ClientId, args: &str) -> RpcResponse {
        let Some(log) = &self.log else {
            return RpcResponse::reply(id, "// No activity log configured", Encore::Done);
        };
        let result = match args {
            "" | "-reopen" => log.reopen(),
            name => log.switch_to(name),
        };
        let text = match result {
            Ok(path) => {
                info!(client_id = id, path = %path.display(), "Activity log rotated");
                format!("// Activity log now {}", path.display())
            }
            Err(e) => {
                warn!(client_id = id, error = %e, "Activity log rotation failed");
                format!("// Cannot open new log: {}", e)
            }
        };
        RpcResponse::reply(id, text, Encore::Done)
    }
}
