//! Saved routes, persisted through the store.

use super::Router;
use crate::connection::ConnectionSnapshot;
use crate::error::RouteError;
use crate::messaging::{Envelope, ServerMessage};
use crate::store::SavedRoute;
use tracing::debug;

/// Upper bound on waypoints accepted in one route.
const MAX_WAYPOINTS: usize = 256;

impl Router {
    pub(super) fn save_route(
        &self,
        envelope: &Envelope,
        me: &ConnectionSnapshot,
        name: &str,
        waypoints: &[String],
    ) -> Result<(), RouteError> {
        let user = me.state.user_id().ok_or(RouteError::NotLoggedIn)?;
        if waypoints.len() > MAX_WAYPOINTS {
            return Err(RouteError::Rejected(format!(
                "a route may hold at most {MAX_WAYPOINTS} waypoints"
            )));
        }

        let route = SavedRoute {
            name: name.trim().to_string(),
            waypoints: waypoints.to_vec(),
        };
        let mut tx = self.store.begin()?;
        if let Err(e) = tx.save_route(user, route) {
            tx.rollback();
            return Err(e.into());
        }
        tx.commit()?;

        debug!("💾 Saved route '{}' for user {}", name.trim(), user);
        self.outbox.push(envelope, ServerMessage::ack("save_route"));
        Ok(())
    }

    pub(super) fn load_routes(&self, envelope: &Envelope, me: &ConnectionSnapshot) -> Result<(), RouteError> {
        let user = me.state.user_id().ok_or(RouteError::NotLoggedIn)?;
        let mut tx = self.store.begin()?;
        let routes = match tx.load_routes(user) {
            Ok(routes) => routes,
            Err(e) => {
                tx.rollback();
                return Err(e.into());
            }
        };
        tx.rollback();

        self.outbox.push(envelope, ServerMessage::Routes { routes });
        Ok(())
    }
}
