use serde_json::{Value, json};

pub fn openapi_spec() -> Value {
    json!({
        "openapi": "3.1.0",
        "info": {
            "title": "Realtime Timeline API",
            "version": env!("CARGO_PKG_VERSION"),
            "description": "Tenant-isolated event timeline with a durable SSE channel and an ephemeral WebSocket channel.",
        },
        "paths": {
            "/healthz": {
                "get": {
                    "summary": "Health check",
                    "responses": {
                        "200": {
                            "description": "Service health",
                            "content": {
                                "application/json": {
                                    "schema": {
                                        "type": "object",
                                        "required": ["status", "service"],
                                        "properties": {
                                            "status": { "type": "string" },
                                            "service": { "type": "string" },
                                        },
                                    },
                                },
                            },
                        },
                    },
                },
            },
            "/openapi.json": {
                "get": {
                    "summary": "OpenAPI document",
                    "responses": {
                        "200": { "description": "This document" },
                    },
                },
            },
            "/docs": {
                "get": {
                    "summary": "Interactive API reference",
                    "responses": {
                        "200": {
                            "description": "HTML page",
                            "content": { "text/html": {} },
                        },
                    },
                },
            },
            "/sse/chat/{thread_id}": {
                "get": {
                    "summary": "Replay then tail a thread's durable events",
                    "description": "Identity is required: a `ticket` query parameter or an `Authorization: Bearer` header. Resumes strictly after `Last-Event-ID` (header) or `last_event_id` (query). An unknown cursor replays nothing.",
                    "parameters": [
                        { "$ref": "#/components/parameters/ThreadIdPath" },
                        { "$ref": "#/components/parameters/TicketQuery" },
                        {
                            "name": "last_event_id",
                            "in": "query",
                            "required": false,
                            "schema": { "type": "string" },
                        },
                        {
                            "name": "Last-Event-ID",
                            "in": "header",
                            "required": false,
                            "schema": { "type": "string" },
                        },
                    ],
                    "security": [{ "bearer": [] }, {}],
                    "responses": {
                        "200": {
                            "description": "Event stream; each frame is `id: <event_id>`, `event: <type>`, `data: <StreamEvent JSON>`",
                            "content": { "text/event-stream": {} },
                        },
                        "401": { "$ref": "#/components/responses/Error" },
                    },
                },
                "post": {
                    "summary": "Append a user message",
                    "parameters": [
                        { "$ref": "#/components/parameters/ThreadIdPath" },
                        { "$ref": "#/components/parameters/TicketQuery" },
                    ],
                    "security": [{ "bearer": [] }, {}],
                    "requestBody": {
                        "required": true,
                        "content": {
                            "application/json": {
                                "schema": { "$ref": "#/components/schemas/PostMessageRequest" },
                            },
                        },
                    },
                    "responses": {
                        "200": {
                            "description": "The appended envelope",
                            "content": {
                                "application/json": {
                                    "schema": {
                                        "type": "object",
                                        "required": ["posted"],
                                        "properties": {
                                            "posted": {
                                                "type": "array",
                                                "items": { "$ref": "#/components/schemas/StreamEvent" },
                                            },
                                        },
                                    },
                                },
                            },
                        },
                        "401": { "$ref": "#/components/responses/Error" },
                        "403": { "$ref": "#/components/responses/Error" },
                        "422": { "$ref": "#/components/responses/Error" },
                    },
                },
            },
            "/ws/chat/{thread_id}": {
                "get": {
                    "summary": "Ephemeral gesture channel (WebSocket upgrade)",
                    "description": "First frame must be `{\"type\":\"hello\",\"context\":{...},\"last_event_id\":\"...\"}`. Afterwards `ping`, `gesture` and `presence_ping` are accepted. Identity or handshake failures close with code 4003.",
                    "parameters": [
                        { "$ref": "#/components/parameters/ThreadIdPath" },
                        { "$ref": "#/components/parameters/TicketQuery" },
                    ],
                    "responses": {
                        "101": { "description": "Switching protocols" },
                    },
                },
            },
        },
        "components": {
            "securitySchemes": {
                "bearer": { "type": "http", "scheme": "bearer", "bearerFormat": "JWT" },
            },
            "parameters": {
                "ThreadIdPath": {
                    "name": "thread_id",
                    "in": "path",
                    "required": true,
                    "schema": { "type": "string" },
                },
                "TicketQuery": {
                    "name": "ticket",
                    "in": "query",
                    "required": false,
                    "schema": { "type": "string" },
                },
            },
            "responses": {
                "Error": {
                    "description": "Structured error",
                    "content": {
                        "application/json": {
                            "schema": { "$ref": "#/components/schemas/Error" },
                        },
                    },
                },
            },
            "schemas": {
                "Error": {
                    "type": "object",
                    "required": ["error"],
                    "properties": {
                        "error": {
                            "type": "object",
                            "required": ["code", "message"],
                            "properties": {
                                "code": { "type": "string" },
                                "message": { "type": "string" },
                            },
                        },
                    },
                },
                "PostMessageRequest": {
                    "type": "object",
                    "required": ["text"],
                    "properties": {
                        "text": { "type": "string" },
                        "sender": {
                            "type": "object",
                            "required": ["id"],
                            "properties": { "id": { "type": "string" } },
                        },
                    },
                },
                "StreamEvent": {
                    "type": "object",
                    "required": ["schema_version", "type", "timestamp", "event_id", "routing", "meta"],
                    "properties": {
                        "schema_version": { "type": "integer" },
                        "type": { "type": "string" },
                        "timestamp": { "type": "string", "format": "date-time" },
                        "sequence": { "type": "integer" },
                        "event_id": { "type": "string" },
                        "trace_id": { "type": "string" },
                        "span_id": { "type": "string" },
                        "ids": { "type": "object" },
                        "routing": { "$ref": "#/components/schemas/RoutingKeys" },
                        "data": {},
                        "atom_metadata": { "type": "object" },
                        "media_payload": { "$ref": "#/components/schemas/MediaSidecar" },
                        "meta": { "$ref": "#/components/schemas/EventMeta" },
                    },
                },
                "RoutingKeys": {
                    "type": "object",
                    "required": ["tenant_id", "project_id"],
                    "properties": {
                        "tenant_id": { "type": "string", "pattern": "^t_[a-z0-9_-]+$" },
                        "project_id": { "type": "string" },
                        "mode": { "type": "string" },
                        "env": { "type": "string" },
                        "thread_id": { "type": "string" },
                        "canvas_id": { "type": "string" },
                        "actor_id": { "type": "string" },
                        "actor_type": { "type": "string", "enum": ["human", "agent", "system"] },
                    },
                },
                "MediaSidecar": {
                    "type": "object",
                    "description": "Reference to external media. `data:` and inline base64 URIs are rejected.",
                    "properties": {
                        "uri": { "type": "string" },
                        "object_id": { "type": "string" },
                        "artifact_id": { "type": "string" },
                        "mime_type": { "type": "string" },
                        "size_bytes": { "type": "integer" },
                        "sha256": { "type": "string" },
                    },
                },
                "EventMeta": {
                    "type": "object",
                    "properties": {
                        "priority": { "type": "string", "enum": ["truth", "gesture", "info", "critical"] },
                        "persist": { "type": "string", "enum": ["always", "sampled", "never"] },
                        "severity": { "type": "string" },
                        "storage_class": { "type": "string", "enum": ["stream", "log"] },
                        "last_event_id": { "type": "string" },
                    },
                },
            },
        },
    })
}

pub fn scalar_docs_html(spec_url: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Timeline API Docs</title>
    <style>
      html, body, #app {{
        margin: 0;
        padding: 0;
        height: 100%;
        width: 100%;
      }}
    </style>
  </head>
  <body>
    <div id="app"></div>
    <script src="https://cdn.jsdelivr.net/npm/@scalar/api-reference"></script>
    <script>
      Scalar.createApiReference('#app', {{
        url: '{spec_url}',
      }});
    </script>
  </body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::{openapi_spec, scalar_docs_html};

    #[test]
    fn openapi_spec_declares_transport_routes() {
        let spec = openapi_spec();
        assert_eq!(spec["openapi"], "3.1.0");
        assert!(spec["paths"]["/openapi.json"].is_object());
        assert!(spec["paths"]["/docs"].is_object());
        assert!(spec["paths"]["/sse/chat/{thread_id}"]["get"].is_object());
        assert!(spec["paths"]["/sse/chat/{thread_id}"]["post"].is_object());
        assert!(spec["paths"]["/ws/chat/{thread_id}"].is_object());
        assert!(spec["components"]["schemas"]["StreamEvent"].is_object());
    }

    #[test]
    fn scalar_html_uses_openapi_url() {
        let html = scalar_docs_html("/openapi.json");
        assert!(html.contains("Scalar.createApiReference('#app'"));
        assert!(html.contains("url: '/openapi.json'"));
    }
}
