use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;

use basket_core::checkout;
use basket_core::consolidation::consolidate_active_cart;
use basket_core::db::Database;
use basket_core::items;
use basket_core::merger::merge_guest_cart;
use basket_core::models::{
    CartDetails, CartError, CartPolicy, Consolidation, LineOutcome, NewProduct, Order, Product,
    validate_new_product, validate_user_id,
};
use basket_core::stock::lookup_stock;

const BODY_LIMIT: usize = 1024 * 1024; // 1 MB

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    policy: CartPolicy,
    api_key: Option<String>,
}

impl AppState {
    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// --- Request / Response types ---

fn default_quantity() -> i64 {
    1
}

#[derive(Deserialize)]
struct SearchQuery {
    q: Option<String>,
}

#[derive(Deserialize)]
struct CreateProductRequest {
    sku: Option<String>,
    name: String,
    price_cents: i64,
    #[serde(default)]
    stock: i64,
}

#[derive(Deserialize)]
struct SetStockRequest {
    stock: i64,
}

#[derive(Deserialize)]
struct StockQuery {
    #[serde(default = "default_quantity")]
    quantity: i64,
}

#[derive(Deserialize)]
struct AddItemRequest {
    product_id: i64,
    #[serde(default = "default_quantity")]
    quantity: i64,
}

#[derive(Deserialize)]
struct SetQuantityRequest {
    quantity: i64,
}

#[derive(Deserialize)]
struct MergeRequest {
    guest_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Internal(err) => {
                tracing::error!("Internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let Some(cart_err) = err.downcast_ref::<CartError>() else {
            return Self::Internal(err);
        };
        let message = cart_err.to_string();
        match cart_err {
            CartError::InvalidQuantity(_) | CartError::TotalTooLarge => Self::BadRequest(message),
            CartError::ProductNotFound(_)
            | CartError::ItemNotInCart(_)
            | CartError::OrderNotFound(_) => Self::NotFound(message),
            CartError::ProductUnavailable(_)
            | CartError::OutOfStock(_)
            | CartError::InsufficientStock { .. }
            | CartError::EmptyCart => Self::Conflict(message),
        }
    }
}

fn user_from_path(user: &str) -> Result<String, ApiError> {
    validate_user_id(user).map_err(|e| ApiError::BadRequest(format!("{e}")))
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(ref expected_key) = state.api_key {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == expected_key);

        if !authorized {
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "Invalid or missing API key".to_string(),
                }),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Catalog handlers ---

async fn list_products(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<Vec<Product>>, ApiError> {
    let search = params.q.as_deref().map(str::trim).filter(|q| !q.is_empty());
    let products = state.db().list_products(search).context("database error")?;
    Ok(Json(products))
}

async fn create_product(
    State(state): State<AppState>,
    Json(req): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<Product>), ApiError> {
    let new_product = NewProduct {
        sku: req.sku,
        name: req.name,
        price_cents: req.price_cents,
        stock: req.stock,
    };
    validate_new_product(&new_product).map_err(|e| ApiError::BadRequest(format!("{e}")))?;

    let db = state.db();
    if let Some(ref sku) = new_product.sku {
        if db.get_product_by_sku(sku).context("database error")?.is_some() {
            return Err(ApiError::Conflict(format!(
                "A product with SKU '{sku}' already exists"
            )));
        }
    }
    let product = db
        .insert_product(&new_product)
        .context("failed to insert product")?;
    Ok((StatusCode::CREATED, Json(product)))
}

async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Product>, ApiError> {
    state
        .db()
        .get_product(id)
        .context("database error")?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Product {id} not found")))
}

async fn set_product_stock(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<SetStockRequest>,
) -> Result<Json<Product>, ApiError> {
    if req.stock < 0 {
        return Err(ApiError::BadRequest(
            "stock must not be negative".to_string(),
        ));
    }
    let db = state.db();
    if !db.set_product_stock(id, req.stock).context("database error")? {
        return Err(ApiError::NotFound(format!("Product {id} not found")));
    }
    let product = db
        .get_product(id)
        .context("database error")?
        .ok_or_else(|| ApiError::NotFound(format!("Product {id} not found")))?;
    Ok(Json(product))
}

async fn check_product_stock(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<StockQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let check = lookup_stock(&state.db(), id, params.quantity, &state.policy)?;
    Ok(Json(serde_json::json!({
        "product_id": id,
        "requested": params.quantity,
        "available": check.is_available(),
        "result": check,
    })))
}

// --- Cart handlers ---

async fn get_cart(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<CartDetails>, ApiError> {
    let user = user_from_path(&user)?;
    let cart = items::cart_details(&state.db(), &user, &state.policy)?;
    Ok(Json(cart))
}

async fn clear_cart(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_from_path(&user)?;
    let removed = items::clear_cart(&state.db(), &user, &state.policy)?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn add_cart_item(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Json(req): Json<AddItemRequest>,
) -> Result<Json<LineOutcome>, ApiError> {
    let user = user_from_path(&user)?;
    let outcome = items::add_item(&state.db(), &user, req.product_id, req.quantity, &state.policy)?;
    Ok(Json(outcome))
}

async fn set_cart_item(
    State(state): State<AppState>,
    Path((user, product_id)): Path<(String, i64)>,
    Json(req): Json<SetQuantityRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = user_from_path(&user)?;
    let outcome =
        items::set_item_quantity(&state.db(), &user, product_id, req.quantity, &state.policy)?;
    let value = match outcome {
        Some(outcome) => serde_json::to_value(outcome).context("failed to serialize line")?,
        None => serde_json::json!({ "removed": true, "product_id": product_id }),
    };
    Ok(Json(value))
}

async fn remove_cart_item(
    State(state): State<AppState>,
    Path((user, product_id)): Path<(String, i64)>,
) -> Result<StatusCode, ApiError> {
    let user = user_from_path(&user)?;
    if items::remove_item(&state.db(), &user, product_id, &state.policy)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(anyhow::Error::from(CartError::ItemNotInCart(product_id)).into())
    }
}

async fn consolidate_cart(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<Consolidation>, ApiError> {
    let user = user_from_path(&user)?;
    let report = consolidate_active_cart(&state.db(), &user, &state.policy)?;
    Ok(Json(report))
}

async fn merge_cart(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Json(req): Json<MergeRequest>,
) -> Result<Json<Consolidation>, ApiError> {
    let user = user_from_path(&user)?;
    let guest = user_from_path(&req.guest_id)?;
    let report = merge_guest_cart(&state.db(), &guest, &user, &state.policy)?;
    Ok(Json(report))
}

// --- Order handlers ---

async fn checkout_cart(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let user = user_from_path(&user)?;
    let order = checkout::checkout(&state.db(), &user, &state.policy)?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn list_orders(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<Vec<Order>>, ApiError> {
    let user = user_from_path(&user)?;
    Ok(Json(checkout::list_orders(&state.db(), &user)?))
}

async fn get_order(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Order>, ApiError> {
    Ok(Json(checkout::get_order(&state.db(), id)?))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/products", get(list_products).post(create_product))
        .route("/api/products/{id}", get(get_product))
        .route(
            "/api/products/{id}/stock",
            get(check_product_stock).put(set_product_stock),
        )
        .route("/api/users/{user}/cart", get(get_cart).delete(clear_cart))
        .route("/api/users/{user}/cart/items", post(add_cart_item))
        .route(
            "/api/users/{user}/cart/items/{product_id}",
            put(set_cart_item).delete(remove_cart_item),
        )
        .route("/api/users/{user}/cart/consolidate", post(consolidate_cart))
        .route("/api/users/{user}/cart/merge", post(merge_cart))
        .route("/api/users/{user}/checkout", post(checkout_cart))
        .route("/api/users/{user}/orders", get(list_orders))
        .route("/api/orders/{id}", get(get_order))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

fn mask_key(key: &str) -> String {
    if key.len() < 12 || !key.is_ascii() {
        return "****".to_string();
    }
    format!("{}...{}", &key[..4], &key[key.len() - 4..])
}

// --- Server startup ---

pub async fn start_server(
    db: Database,
    policy: CartPolicy,
    port: u16,
    bind: &str,
    api_key: Option<String>,
    new_api_key: bool,
) -> anyhow::Result<()> {
    let state = AppState {
        db: Arc::new(Mutex::new(db)),
        policy,
        api_key: api_key.clone(),
    };

    let app = build_router(state);

    match api_key {
        Some(ref key) if new_api_key => {
            eprintln!("Generated new API key: {key}");
            eprintln!("Include in requests: Authorization: Bearer {key}");
        }
        Some(ref key) => {
            eprintln!(
                "API key: {} (see api_key file in data directory)",
                mask_key(key)
            );
        }
        None => {
            eprintln!("Warning: Authentication disabled (--no-auth). API is open to anyone.");
        }
    }

    if bind != "127.0.0.1" && bind != "localhost" && api_key.is_none() {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. \
             Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("failed to bind {bind}:{port}"))?;
    tracing::info!(
        bind,
        port,
        max_item_quantity = policy.max_item_quantity,
        "listening on http://{bind}:{port}"
    );
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(api_key: Option<String>) -> AppState {
        AppState {
            db: Arc::new(Mutex::new(Database::open_in_memory().unwrap())),
            policy: CartPolicy::default(),
            api_key,
        }
    }

    fn seed_product(state: &AppState, sku: &str, price_cents: i64, stock: i64) -> Product {
        state
            .db()
            .insert_product(&NewProduct {
                sku: Some(sku.to_string()),
                name: format!("Product {sku}"),
                price_cents,
                stock,
            })
            .unwrap()
    }

    async fn send(
        state: &AppState,
        request: axum::http::Request<Body>,
    ) -> (StatusCode, serde_json::Value) {
        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn json_request(
        method: &str,
        uri: &str,
        body: &serde_json::Value,
    ) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn auth_missing_key_returns_401() {
        let app = build_router(test_state(Some("test-key-abc123".to_string())));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/products")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Invalid or missing API key");
    }

    #[tokio::test]
    async fn auth_wrong_key_returns_401() {
        let app = build_router(test_state(Some("test-key-abc123".to_string())));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/products")
                    .header("Authorization", "Bearer wrong-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn auth_correct_key_succeeds() {
        let app = build_router(test_state(Some("test-key-abc123".to_string())));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/products")
                    .header("Authorization", "Bearer test-key-abc123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn security_headers_present() {
        let app = build_router(test_state(Some("secret".to_string())));

        let response = app
            .oneshot(
                axum::http::Request::get("/api/products")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            response.headers().get("content-security-policy").unwrap(),
            "default-src 'none'"
        );
    }

    #[tokio::test]
    async fn body_size_limit_rejects_oversized() {
        let app = build_router(test_state(None));

        let big_body = vec![0u8; BODY_LIMIT + 1];
        let response = app
            .oneshot(
                axum::http::Request::post("/api/products")
                    .header("content-type", "application/json")
                    .body(Body::from(big_body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn internal_error_does_not_leak_details() {
        let error = ApiError::from(anyhow::anyhow!("secret database path /home/user/.basket/db"));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Internal server error");
    }

    #[test]
    fn cart_errors_map_to_status_codes() {
        let status = |err: CartError| {
            ApiError::from(anyhow::Error::from(err))
                .into_response()
                .status()
        };
        assert_eq!(status(CartError::InvalidQuantity(0)), StatusCode::BAD_REQUEST);
        assert_eq!(status(CartError::ProductNotFound(1)), StatusCode::NOT_FOUND);
        assert_eq!(status(CartError::OrderNotFound(1)), StatusCode::NOT_FOUND);
        assert_eq!(status(CartError::OutOfStock(1)), StatusCode::CONFLICT);
        assert_eq!(status(CartError::EmptyCart), StatusCode::CONFLICT);
        assert_eq!(status(CartError::TotalTooLarge), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_and_list_products() {
        let state = test_state(None);

        let (status, json) = send(
            &state,
            json_request(
                "POST",
                "/api/products",
                &serde_json::json!({
                    "sku": "MUG-1",
                    "name": "Mug",
                    "price_cents": 800,
                    "stock": 4
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["name"], "Mug");
        assert_eq!(json["active"], true);

        let (status, _) = send(
            &state,
            json_request(
                "POST",
                "/api/products",
                &serde_json::json!({ "sku": "MUG-1", "name": "Other", "price_cents": 1 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &state,
            json_request(
                "POST",
                "/api/products",
                &serde_json::json!({ "name": "Bad", "price_cents": -5 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = send(&state, empty_request("GET", "/api/products?q=mug")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stock_endpoints() {
        let state = test_state(None);
        let mug = seed_product(&state, "MUG-1", 800, 3);

        let (status, json) = send(
            &state,
            empty_request("GET", &format!("/api/products/{}/stock?quantity=5", mug.id)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["available"], false);
        assert_eq!(json["result"]["status"], "limited");
        assert_eq!(json["result"]["available"], 3);

        let (status, json) = send(
            &state,
            json_request(
                "PUT",
                &format!("/api/products/{}/stock", mug.id),
                &serde_json::json!({ "stock": 9 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["stock"], 9);

        let (status, _) = send(&state, empty_request("GET", "/api/products/999/stock")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(
            &state,
            empty_request("GET", &format!("/api/products/{}/stock?quantity=0", mug.id)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn add_item_caps_and_reports() {
        let state = test_state(None);
        let mug = seed_product(&state, "MUG-1", 800, 3);

        let (status, json) = send(
            &state,
            json_request(
                "POST",
                "/api/users/alice/cart/items",
                &serde_json::json!({ "product_id": mug.id, "quantity": 5 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["item"]["quantity"], 3);
        assert_eq!(json["capped"], true);
        assert_eq!(json["adjustment"]["reason"], "stock_limit");

        let (status, json) = send(&state, empty_request("GET", "/api/users/alice/cart")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total_items"], 3);
        assert_eq!(json["total_cents"], 2400);
    }

    #[tokio::test]
    async fn add_item_errors() {
        let state = test_state(None);
        let gone = seed_product(&state, "GONE", 500, 0);

        let (status, json) = send(
            &state,
            json_request(
                "POST",
                "/api/users/alice/cart/items",
                &serde_json::json!({ "product_id": gone.id }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("out of stock"));

        let (status, _) = send(
            &state,
            json_request(
                "POST",
                "/api/users/alice/cart/items",
                &serde_json::json!({ "product_id": 4242 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &state,
            json_request(
                "POST",
                "/api/users/%20/cart/items",
                &serde_json::json!({ "product_id": gone.id }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn set_and_remove_items() {
        let state = test_state(None);
        let mug = seed_product(&state, "MUG-1", 800, 10);
        let uri = format!("/api/users/alice/cart/items/{}", mug.id);

        let (status, _) = send(
            &state,
            json_request("PUT", &uri, &serde_json::json!({ "quantity": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        send(
            &state,
            json_request(
                "POST",
                "/api/users/alice/cart/items",
                &serde_json::json!({ "product_id": mug.id }),
            ),
        )
        .await;

        let (status, json) = send(
            &state,
            json_request("PUT", &uri, &serde_json::json!({ "quantity": 4 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["item"]["quantity"], 4);

        let (status, json) = send(
            &state,
            json_request("PUT", &uri, &serde_json::json!({ "quantity": -1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "Invalid quantity -1");

        let (status, _) = send(&state, empty_request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&state, empty_request("DELETE", &uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn consolidate_and_merge() {
        let state = test_state(None);
        let mug = seed_product(&state, "MUG-1", 800, 10);
        {
            let db = state.db();
            let old = db.create_cart("alice").unwrap();
            db.insert_cart_item(old.id, mug.id, 1, 800).unwrap();
            db.create_cart("alice").unwrap();
            let guest = db.create_cart("guest-9").unwrap();
            db.insert_cart_item(guest.id, mug.id, 2, 800).unwrap();
        }

        let (status, json) = send(
            &state,
            empty_request("POST", "/api/users/alice/cart/consolidate"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["merged_cart_ids"].as_array().unwrap().len(), 1);

        let (status, json) = send(
            &state,
            json_request(
                "POST",
                "/api/users/alice/cart/merge",
                &serde_json::json!({ "guest_id": "guest-9" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["cart"]["user_id"], "alice");

        let (_, json) = send(&state, empty_request("GET", "/api/users/alice/cart")).await;
        assert_eq!(json["total_items"], 3);
    }

    #[tokio::test]
    async fn checkout_flow() {
        let state = test_state(None);
        let mug = seed_product(&state, "MUG-1", 800, 5);

        let (status, json) = send(&state, empty_request("POST", "/api/users/alice/checkout")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"], "Cart is empty");

        send(
            &state,
            json_request(
                "POST",
                "/api/users/alice/cart/items",
                &serde_json::json!({ "product_id": mug.id, "quantity": 2 }),
            ),
        )
        .await;

        let (status, order) =
            send(&state, empty_request("POST", "/api/users/alice/checkout")).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(order["total_cents"], 1600);

        let (status, json) = send(&state, empty_request("GET", "/api/users/alice/orders")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);

        let (status, json) = send(
            &state,
            empty_request("GET", &format!("/api/orders/{}", order["id"])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["items"][0]["quantity"], 2);

        let (status, _) = send(&state, empty_request("GET", "/api/orders/777")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, product) = send(
            &state,
            empty_request("GET", &format!("/api/products/{}", mug.id)),
        )
        .await;
        assert_eq!(product["stock"], 3);
    }

    #[test]
    fn mask_key_hides_middle() {
        assert_eq!(mask_key("abcdef0123456789"), "abcd...6789");
        assert_eq!(mask_key("short"), "****");
    }
}
